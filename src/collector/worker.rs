//! Worker: receives per-partition batches from the batcher and forwards
//! their raw bytes to the tunnel. A worker belongs to exactly one syncer;
//! the syncer reads `ack_lsn` to advance the checkpoint.

use crate::metrics::ReplicationMetric;
use crate::oplog::GenericOplog;
use crate::timestamp;
use crate::tunnel::Tunnel;
use crate::PIPELINE_QUEUE_LEN;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// First retry delay after a tunnel failure; doubles up to [MAX_BACKOFF].
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_millis(crate::DURATION_TIME_MS);

pub struct Worker {
    id: u32,
    tx: Sender<Vec<GenericOplog>>,
    ack_lsn: Arc<AtomicI64>,
    unack_lsn: AtomicI64,
}

impl Worker {
    /// Spawn the worker thread. The returned handle finishes once every
    /// clone of the [Worker] (and with it the batch sender) is dropped and
    /// the queue has drained.
    pub fn start(
        id: u32,
        tunnel: Arc<dyn Tunnel>,
        metric: Arc<ReplicationMetric>,
    ) -> (Arc<Worker>, JoinHandle<()>) {
        let (tx, rx) = bounded(PIPELINE_QUEUE_LEN);
        let ack_lsn = Arc::new(AtomicI64::new(0));
        let thread_ack = ack_lsn.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || run(id, rx, tunnel, thread_ack, metric))
            .expect("spawn worker thread");
        (
            Arc::new(Worker {
                id,
                tx,
                ack_lsn,
                unack_lsn: AtomicI64::new(0),
            }),
            handle,
        )
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Offer one batch. The bounded queue blocks when the tunnel lags;
    /// returning true means the batch is accepted and will be forwarded.
    pub fn offer(&self, batch: Vec<GenericOplog>) -> bool {
        if let Some(newest) = batch.last() {
            self.unack_lsn
                .fetch_max(timestamp::to_i64(newest.parsed.ts), Ordering::SeqCst);
        }
        self.tx.send(batch).is_ok()
    }

    /// Greatest timestamp handed to the tunnel and acknowledged, packed.
    pub fn ack_lsn(&self) -> i64 {
        self.ack_lsn.load(Ordering::SeqCst)
    }

    /// Greatest timestamp offered to this worker, packed. Together with
    /// [ack_lsn](Worker::ack_lsn) this tells an idle worker (both zero)
    /// apart from one with a batch still in flight.
    pub fn unack_lsn(&self) -> i64 {
        self.unack_lsn.load(Ordering::SeqCst)
    }
}

fn run(
    id: u32,
    rx: Receiver<Vec<GenericOplog>>,
    tunnel: Arc<dyn Tunnel>,
    ack_lsn: Arc<AtomicI64>,
    metric: Arc<ReplicationMetric>,
) {
    info!(worker = id, "worker started");
    for batch in rx.iter() {
        let newest = match batch.last() {
            Some(log) => log.parsed.ts,
            None => continue,
        };
        metric.add_apply(batch.len() as u64);

        // retry transient transport failures forever with a capped backoff;
        // the ack LSN must not move past an unacknowledged batch, so a
        // permanently broken tunnel surfaces as checkpoint lag.
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match tunnel.send(&batch) {
                Ok(()) => {
                    ack_lsn.fetch_max(timestamp::to_i64(newest), Ordering::SeqCst);
                    metric.add_success(batch.len() as u64);
                    metric.set_lsn_ack(timestamp::to_i64(newest));
                    break;
                }
                Err(err) => {
                    warn!(worker = id, %err, backoff_ms = backoff.as_millis() as u64,
                        "tunnel transmit failed, retrying");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
    info!(worker = id, "worker drained and stopped");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::SyncError;
    use crate::oplog::{OplogEntry, OpType};
    use bson::{doc, RawDocumentBuf, Timestamp};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn oplog(time: u32, increment: u32, id: i32) -> GenericOplog {
        let doc = doc! {
            "ts": Timestamp { time, increment },
            "op": "i",
            "ns": "bb.items",
            "o": { "_id": id },
        };
        GenericOplog {
            raw: RawDocumentBuf::from_bytes(bson::to_vec(&doc).unwrap()).unwrap(),
            parsed: OplogEntry {
                ts: Timestamp { time, increment },
                op: OpType::Insert,
                ns: "bb.items".to_string(),
                g: None,
                o: doc! { "_id": id },
                o2: None,
            },
        }
    }

    /// Records every delivered timestamp; optionally fails the first N sends.
    struct RecordingTunnel {
        seen: Mutex<Vec<Timestamp>>,
        failures_left: AtomicUsize,
    }

    impl RecordingTunnel {
        fn new(failures: usize) -> Arc<RecordingTunnel> {
            Arc::new(RecordingTunnel {
                seen: Mutex::new(Vec::new()),
                failures_left: AtomicUsize::new(failures),
            })
        }
    }

    impl Tunnel for RecordingTunnel {
        fn send(&self, batch: &[GenericOplog]) -> crate::Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::ChannelClosed);
            }
            let mut seen = self.seen.lock().unwrap();
            seen.extend(batch.iter().map(|l| l.parsed.ts));
            Ok(())
        }
    }

    #[test]
    fn test_worker_fifo_and_ack() {
        let tunnel = RecordingTunnel::new(0);
        let metric = Arc::new(ReplicationMetric::new("rs-test"));
        let (worker, handle) = Worker::start(0, tunnel.clone(), metric);

        assert!(worker.offer(vec![oplog(100, 1, 1), oplog(100, 2, 2)]));
        assert!(worker.offer(vec![oplog(101, 1, 3)]));
        drop(worker);
        handle.join().unwrap();

        let seen = tunnel.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Timestamp { time: 100, increment: 1 },
                Timestamp { time: 100, increment: 2 },
                Timestamp { time: 101, increment: 1 },
            ]
        );
    }

    #[test]
    fn test_worker_retries_without_advancing_ack() {
        let tunnel = RecordingTunnel::new(2);
        let metric = Arc::new(ReplicationMetric::new("rs-test"));
        let (worker, handle) = Worker::start(1, tunnel.clone(), metric);

        assert!(worker.offer(vec![oplog(200, 1, 1)]));
        // the batch eventually lands despite two transient failures.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.ack_lsn() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            worker.ack_lsn(),
            timestamp::to_i64(Timestamp { time: 200, increment: 1 })
        );
        assert_eq!(tunnel.seen.lock().unwrap().len(), 1);
        drop(worker);
        handle.join().unwrap();
    }
}
