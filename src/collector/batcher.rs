//! The batcher merges parsed batches from the deserializer partitions,
//! applies the filter chain, fans entries out to workers by the shard hash
//! and marks barriers.
//!
//! Ordering contract: entries of one partition keep their arrival order in
//! the per-worker output; partitions are visited round-robin from a stable
//! cursor so no partition starves. A barrier (command/DDL entry) closes the
//! batch right after itself and is routed to every worker; the syncer holds
//! back later entries until the barrier checkpoint has caught up.

use crate::filter::FilterChain;
use crate::oplog::{GenericOplog, OplogEntry, OplogHasher};
use crate::timestamp;
use crate::ADAPTIVE_BATCHING_MAX_SIZE;
use bson::Timestamp;
use crossbeam::channel::Receiver;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::error;

use super::worker::Worker;

pub struct Batcher {
    logs_queues: Vec<Receiver<Vec<GenericOplog>>>,
    filter_chain: FilterChain,
    hasher: OplogHasher,
    workers: Vec<Arc<Worker>>,
    /// round-robin cursor over the partitions, kept across calls.
    next_queue_cursor: usize,
    /// pulled from the queues but not yet released past a barrier.
    staged: VecDeque<GenericOplog>,
    last_oplog: Option<OplogEntry>,
    last_filtered: Option<OplogEntry>,
    /// DDL at or before this position means full sync and oplog replay
    /// disagree about schema history.
    full_sync_finish: Timestamp,
}

impl Batcher {
    pub fn new(
        logs_queues: Vec<Receiver<Vec<GenericOplog>>>,
        filter_chain: FilterChain,
        hasher: OplogHasher,
        workers: Vec<Arc<Worker>>,
        full_sync_finish: Timestamp,
    ) -> Batcher {
        Batcher {
            logs_queues,
            filter_chain,
            hasher,
            workers,
            next_queue_cursor: 0,
            staged: VecDeque::new(),
            last_oplog: None,
            last_filtered: None,
            full_sync_finish,
        }
    }

    /// The most recent accepted entry and the most recent filtered entry,
    /// for checkpoint advancement when the feed is entirely filtered.
    pub fn get_last_oplog(&self) -> (Option<&OplogEntry>, Option<&OplogEntry>) {
        (self.last_oplog.as_ref(), self.last_filtered.as_ref())
    }

    /// One batching pass. Returns the per-worker slices, whether the batch
    /// closed on a barrier, and whether nothing was released.
    pub fn batch_more(&mut self) -> (Vec<Vec<GenericOplog>>, bool, bool) {
        let worker_count = self.workers.len();
        if worker_count == 0 {
            return (Vec::new(), false, true);
        }
        self.refill();

        let mut batched: Vec<Vec<GenericOplog>> = (0..worker_count).map(|_| Vec::new()).collect();
        let mut barrier = false;
        let mut released = 0usize;

        while released < ADAPTIVE_BATCHING_MAX_SIZE {
            let log = match self.staged.pop_front() {
                Some(log) => log,
                None => break,
            };
            if self.filter_chain.iterate_filter(&log.parsed) {
                self.last_filtered = Some(log.parsed);
                continue;
            }
            released += 1;
            let is_barrier = log.parsed.op.is_command();
            self.last_oplog = Some(log.parsed.clone());
            if is_barrier {
                if log.parsed.ts <= self.full_sync_finish {
                    error!(
                        ts = ?log.parsed.ts,
                        full_sync_finish = ?self.full_sync_finish,
                        ns = %log.parsed.ns,
                        "DDL before the full sync finish position, replay history is unsafe"
                    );
                }
                // a barrier goes to every worker and seals the batch.
                for slot in batched.iter_mut() {
                    slot.push(log.clone());
                }
                barrier = true;
                break;
            }
            let hash = self.hasher.distribute(&log.parsed).unwrap_or(0);
            batched[(hash as usize) % worker_count].push(log);
        }

        (batched, barrier, released == 0)
    }

    /// Offer each non-empty slice to its worker. True iff at least one
    /// worker received entries. The worker queues are bounded, so a send
    /// that returns has been accepted; a barrier batch therefore cannot be
    /// half-dispatched.
    pub fn dispatch_batches(&self, batched: Vec<Vec<GenericOplog>>) -> bool {
        let mut worked = false;
        for (index, batch) in batched.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            worked |= self.workers[index].offer(batch);
        }
        worked
    }

    /// Lowest acknowledged timestamp across the bound workers, packed.
    /// Workers that were never offered anything are skipped, otherwise one
    /// idle worker would pin the checkpoint at zero; a worker with a batch
    /// in flight still contributes its (possibly zero) ack and holds the
    /// checkpoint back until the tunnel confirms.
    pub fn lowest_worker_ack(&self) -> i64 {
        let mut lowest: Option<i64> = None;
        for worker in &self.workers {
            let ack = worker.ack_lsn();
            if ack == 0 && worker.unack_lsn() == 0 {
                continue;
            }
            lowest = Some(lowest.map_or(ack, |low| low.min(ack)));
        }
        lowest.unwrap_or(0)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Newest released timestamp, if any entry was ever accepted.
    pub fn newest_released(&self) -> Timestamp {
        self.last_oplog
            .as_ref()
            .map(|log| log.ts)
            .unwrap_or(timestamp::ZERO)
    }

    /// Pull pending parsed batches into the staging deque, round-robin
    /// across partitions, without exceeding the per-pass entry budget.
    fn refill(&mut self) {
        let queues = self.logs_queues.len();
        if queues == 0 {
            return;
        }
        loop {
            if self.staged.len() >= ADAPTIVE_BATCHING_MAX_SIZE {
                return;
            }
            let mut pulled = false;
            for offset in 0..queues {
                let index = (self.next_queue_cursor + offset) % queues;
                if let Ok(batch) = self.logs_queues[index].try_recv() {
                    self.staged.extend(batch);
                    pulled = true;
                }
            }
            self.next_queue_cursor = (self.next_queue_cursor + 1) % queues;
            if !pulled {
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::filter::{FilterChain, NamespaceFilter, OplogFilter};
    use crate::metrics::ReplicationMetric;
    use crate::oplog::OpType;
    use crate::tunnel::Tunnel;
    use bson::{doc, Document, RawDocumentBuf};
    use crossbeam::channel::bounded;
    use std::sync::Mutex;

    struct NullTunnel;

    impl Tunnel for NullTunnel {
        fn send(&self, _batch: &[GenericOplog]) -> crate::Result<()> {
            Ok(())
        }
    }

    struct SeenTunnel(Mutex<Vec<Timestamp>>);

    impl Tunnel for SeenTunnel {
        fn send(&self, batch: &[GenericOplog]) -> crate::Result<()> {
            self.0.lock().unwrap().extend(batch.iter().map(|l| l.parsed.ts));
            Ok(())
        }
    }

    fn oplog(op: OpType, time: u32, increment: u32, ns: &str, o: Document) -> GenericOplog {
        let doc = doc! {
            "ts": Timestamp { time, increment },
            "op": op.code(),
            "ns": ns,
            "o": o.clone(),
        };
        GenericOplog {
            raw: RawDocumentBuf::from_bytes(bson::to_vec(&doc).unwrap()).unwrap(),
            parsed: OplogEntry {
                ts: Timestamp { time, increment },
                op,
                ns: ns.to_string(),
                g: None,
                o,
                o2: None,
            },
        }
    }

    fn spawn_workers(n: usize) -> (Vec<Arc<Worker>>, Vec<std::thread::JoinHandle<()>>) {
        let metric = Arc::new(ReplicationMetric::new("rs-test"));
        (0..n as u32)
            .map(|i| Worker::start(i, Arc::new(NullTunnel), metric.clone()))
            .unzip()
    }

    fn batcher_with(
        queues: usize,
        workers: Vec<Arc<Worker>>,
        chain: FilterChain,
    ) -> (Vec<crossbeam::channel::Sender<Vec<GenericOplog>>>, Batcher) {
        let (txs, rxs): (Vec<_>, Vec<_>) =
            (0..queues).map(|_| bounded(crate::PIPELINE_QUEUE_LEN)).unzip();
        let batcher = Batcher::new(rxs, chain, OplogHasher::PrimaryKey, workers, timestamp::ZERO);
        (txs, batcher)
    }

    #[test]
    fn test_barrier_closes_batch_and_fans_out() {
        // insert, insert, createIndex (DDL), insert across four workers.
        let (workers, _handles) = spawn_workers(4);
        let (txs, mut batcher) = batcher_with(1, workers, FilterChain::default());
        txs[0]
            .send(vec![
                oplog(OpType::Insert, 10001, 0, "bb.items", doc! { "_id": 1 }),
                oplog(OpType::Insert, 10002, 0, "bb.items", doc! { "_id": 2 }),
                oplog(
                    OpType::Command,
                    10003,
                    0,
                    "bb.$cmd",
                    doc! { "createIndexes": "items", "key": { "a": 1 }, "name": "a_1" },
                ),
                oplog(OpType::Insert, 10004, 0, "bb.items", doc! { "_id": 3 }),
            ])
            .unwrap();

        let (batched, barrier, all_empty) = batcher.batch_more();
        assert!(barrier);
        assert!(!all_empty);
        // the barrier entry reached all four workers.
        let barrier_ts = Timestamp { time: 10003, increment: 0 };
        for slice in &batched {
            assert_eq!(slice.last().unwrap().parsed.ts, barrier_ts);
        }
        // the trailing insert is withheld for the next pass.
        let held: Vec<_> = batched
            .iter()
            .flat_map(|s| s.iter())
            .filter(|l| l.parsed.ts > barrier_ts)
            .collect();
        assert!(held.is_empty());

        let (batched2, barrier2, all_empty2) = batcher.batch_more();
        assert!(!barrier2);
        assert!(!all_empty2);
        let released: usize = batched2.iter().map(|s| s.len()).sum();
        assert_eq!(released, 1);
    }

    #[test]
    fn test_partition_fifo_is_preserved() {
        let (workers, _handles) = spawn_workers(1);
        let (txs, mut batcher) = batcher_with(2, workers, FilterChain::default());
        txs[0]
            .send(vec![
                oplog(OpType::Insert, 1, 1, "bb.items", doc! { "_id": 1 }),
                oplog(OpType::Insert, 1, 2, "bb.items", doc! { "_id": 2 }),
            ])
            .unwrap();
        txs[1]
            .send(vec![
                oplog(OpType::Insert, 2, 1, "bb.items", doc! { "_id": 3 }),
                oplog(OpType::Insert, 2, 2, "bb.items", doc! { "_id": 4 }),
            ])
            .unwrap();

        let (batched, _, _) = batcher.batch_more();
        let order: Vec<Timestamp> = batched[0].iter().map(|l| l.parsed.ts).collect();
        // within each partition arrival order holds.
        let p1: Vec<_> = order.iter().filter(|t| t.time == 1).collect();
        let p2: Vec<_> = order.iter().filter(|t| t.time == 2).collect();
        assert_eq!(p1, vec![&Timestamp { time: 1, increment: 1 }, &Timestamp { time: 1, increment: 2 }]);
        assert_eq!(p2, vec![&Timestamp { time: 2, increment: 1 }, &Timestamp { time: 2, increment: 2 }]);
    }

    #[test]
    fn test_filtered_entries_never_reach_workers() {
        let chain = FilterChain::new(vec![OplogFilter::Namespace(NamespaceFilter::new(
            vec![],
            vec!["blacked".to_string()],
        ))]);
        let (workers, _handles) = spawn_workers(2);
        let (txs, mut batcher) = batcher_with(1, workers, chain);
        txs[0]
            .send(vec![
                oplog(OpType::Insert, 10200, 5, "blacked.items", doc! { "_id": 1 }),
            ])
            .unwrap();

        let (batched, barrier, all_empty) = batcher.batch_more();
        assert!(all_empty);
        assert!(!barrier);
        assert!(batched.iter().all(|s| s.is_empty()));
        let (last, last_filtered) = batcher.get_last_oplog();
        assert!(last.is_none());
        assert_eq!(
            last_filtered.unwrap().ts,
            Timestamp { time: 10200, increment: 5 }
        );
    }

    #[test]
    fn test_hash_routing_is_stable() {
        let (workers, _handles) = spawn_workers(4);
        let (txs, mut batcher) = batcher_with(1, workers, FilterChain::default());
        let entry = || oplog(OpType::Insert, 7, 1, "bb.items", doc! { "_id": 42 });
        txs[0].send(vec![entry()]).unwrap();
        let (first, _, _) = batcher.batch_more();
        let first_worker = first.iter().position(|s| !s.is_empty()).unwrap();

        txs[0].send(vec![entry()]).unwrap();
        let (second, _, _) = batcher.batch_more();
        let second_worker = second.iter().position(|s| !s.is_empty()).unwrap();
        assert_eq!(first_worker, second_worker);
    }

    #[test]
    fn test_idle_workers_do_not_pin_the_ack_floor() {
        let (workers, _handles) = spawn_workers(4);
        let (txs, mut batcher) = batcher_with(1, workers, FilterChain::default());
        txs[0]
            .send(vec![oplog(OpType::Insert, 50, 1, "bb.items", doc! { "_id": 7 })])
            .unwrap();
        let (batched, _, _) = batcher.batch_more();
        assert!(batcher.dispatch_batches(batched));

        // only one worker ever saw data; the other three must not hold the
        // ack floor at zero.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let want = timestamp::to_i64(Timestamp { time: 50, increment: 1 });
        while batcher.lowest_worker_ack() < want && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(batcher.lowest_worker_ack(), want);
    }

    #[test]
    fn test_dispatch_reports_work_and_delivers() {
        let metric = Arc::new(ReplicationMetric::new("rs-test"));
        let tunnel = Arc::new(SeenTunnel(Mutex::new(Vec::new())));
        let (worker, handle) = Worker::start(0, tunnel.clone(), metric);
        let (txs, mut batcher) = batcher_with(1, vec![worker], FilterChain::default());
        txs[0]
            .send(vec![oplog(OpType::Insert, 9, 1, "bb.items", doc! { "_id": 1 })])
            .unwrap();
        let (batched, _, all_empty) = batcher.batch_more();
        assert!(!all_empty);
        assert!(batcher.dispatch_batches(batched));
        // nothing pending → dispatch of an empty pass reports no work.
        let (empty, _, _) = batcher.batch_more();
        assert!(!batcher.dispatch_batches(empty));

        drop(batcher);
        handle.join().unwrap();
        assert_eq!(tunnel.0.lock().unwrap().len(), 1);
    }
}
