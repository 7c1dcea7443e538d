//! Per-source oplog syncer.
//!
//! Data flow: source oplog → reader → fetch buffer → pending queues (raw
//! batches) → deserializer partitions → logs queues (parsed batches) →
//! batcher → hashed worker queues → tunnel. Splitting the raw and parsed
//! queues keeps the CPU-bound bson decoding off the fetch path. Checkpoints
//! are written out-of-band by the batcher task as worker acks advance.

use crate::checkpoint::CheckpointManager;
use crate::error::{Result, SyncError};
use crate::filter::FilterChain;
use crate::metrics::ReplicationMetric;
use crate::oplog::{GenericOplog, OplogHasher};
use crate::quorum::{Sentinel, SimpleRateController};
use crate::timestamp;
use crate::{
    DDL_CHECKPOINT_INTERVAL_MS, DURATION_TIME_MS, FILTER_CHECKPOINT_CHECK_INTERVAL_SECS,
    FILTER_CHECKPOINT_GAP_SECS, PIPELINE_QUEUE_LEN, PIPELINE_QUEUE_MAX_NR, PIPELINE_QUEUE_MIN_NR,
};
use bson::{RawDocumentBuf, Timestamp};
use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::batcher::Batcher;
use super::reader::OplogReader;
use super::worker::Worker;

/// Idle sleep of the batcher task when the pipeline is drained.
const BATCHER_IDLE_SLEEP_MS: u64 = 10;

/// How many deserializer partitions a syncer runs. A sharded source already
/// parallelizes across per-shard syncers, so one partition is enough there.
pub fn pipeline_queue_count(is_shard_cluster: bool) -> usize {
    if is_shard_cluster {
        PIPELINE_QUEUE_MIN_NR
    } else {
        PIPELINE_QUEUE_MAX_NR
    }
}

/// Buffer of raw entries in front of the pending queues; flushes when full
/// or when the feed goes idle.
pub struct FetchBuffer {
    entries: Vec<RawDocumentBuf>,
    capacity: usize,
}

impl FetchBuffer {
    pub fn new(capacity: usize) -> FetchBuffer {
        FetchBuffer {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Add an entry (or a `None` idle tick). Returns a batch to push into
    /// the current partition when the buffer must flush.
    pub fn push(&mut self, entry: Option<RawDocumentBuf>) -> Option<Vec<RawDocumentBuf>> {
        let flush_on_idle = match entry {
            Some(raw) => {
                self.entries.push(raw);
                false
            }
            None => true,
        };
        if self.entries.len() >= self.capacity || (flush_on_idle && !self.entries.is_empty()) {
            let mut out = Vec::with_capacity(self.capacity);
            std::mem::swap(&mut self.entries, &mut out);
            return Some(out);
        }
        None
    }
}

/// State shared between the poll loop and the batcher task.
struct BatchContext {
    replset: String,
    ckpt_manager: Arc<CheckpointManager>,
    reader: Arc<OplogReader>,
    metric: Arc<ReplicationMetric>,
    worker_num: usize,
    shutdown: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl BatchContext {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst)
    }

    /// Flush the checkpoint from the worker acks. A nonzero `override_ts`
    /// comes from the mandatory filtered-feed advance, where the caller has
    /// already waited for every accepted entry to be acknowledged, so it
    /// may pass the ack floor.
    fn checkpoint(&self, batcher: &Batcher, force: bool, override_ts: Timestamp) {
        let min_ack = batcher.lowest_worker_ack();
        let over = timestamp::to_i64(override_ts);
        let candidate = if over == 0 { min_ack } else { min_ack.max(over) };
        if candidate == 0 {
            return;
        }
        let candidate_ts = timestamp::from_i64(candidate);
        match self
            .ckpt_manager
            .update(candidate_ts, force || over != 0)
        {
            Ok(()) => {
                self.metric.set_lsn_ack(min_ack);
                self.metric.set_lsn_ckpt(candidate);
            }
            Err(err) => {
                // retried on the next batcher tick; monotonicity is intact.
                warn!(replset = %self.replset, %err, "checkpoint flush failed");
            }
        }
    }

    /// After a barrier: spin until the stored checkpoint reaches `newest`
    /// so a DDL entry is durable before anything later is released. With a
    /// single worker FIFO already guarantees this.
    fn check_checkpoint_update(&self, batcher: &Batcher, barrier: bool, newest: Timestamp) {
        if !barrier || newest == timestamp::ZERO || self.worker_num <= 1 {
            return;
        }
        info!(replset = %self.replset, ?newest, "barrier found, waiting for checkpoint");
        loop {
            match self.ckpt_manager.get() {
                Ok(ckpt) if ckpt >= newest => {
                    info!(replset = %self.replset, ?ckpt, "barrier checkpoint updated");
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(replset = %self.replset, %err, "barrier checkpoint read failed");
                }
            }
            if self.stopping() {
                return;
            }
            thread::sleep(Duration::from_millis(DDL_CHECKPOINT_INTERVAL_MS));
            self.checkpoint(batcher, true, timestamp::ZERO);
        }
    }
}

pub struct OplogSyncer {
    replset: String,
    reader: Arc<OplogReader>,
    ckpt_manager: Arc<CheckpointManager>,
    metric: Arc<ReplicationMetric>,
    sentinel: Arc<Sentinel>,
    rate_controller: Arc<SimpleRateController>,
    shutdown: Arc<AtomicBool>,
    /// set on a fatal per-source condition (capped oplog).
    stopped: Arc<AtomicBool>,
    filter_chain: Option<FilterChain>,
    hasher: OplogHasher,
    workers: Vec<Arc<Worker>>,
    full_sync_finish: Timestamp,
    partitions: usize,
    pending_senders: Vec<Sender<Vec<RawDocumentBuf>>>,
    buffer: FetchBuffer,
    next_queue_position: u64,
}

enum Fetched {
    Ok,
    /// transient trouble: leave `poll` so the outer loop yields and re-enters.
    Yield,
    /// the source truncated past the resume point.
    Fatal,
}

impl OplogSyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: &str,
        replset: impl Into<String>,
        full_sync_finish: Timestamp,
        filter_chain: FilterChain,
        hasher: OplogHasher,
        ckpt_manager: CheckpointManager,
        sentinel: Arc<Sentinel>,
        rate_controller: Arc<SimpleRateController>,
        shutdown: Arc<AtomicBool>,
        is_shard_cluster: bool,
        fetcher_buffer_capacity: usize,
    ) -> Result<OplogSyncer> {
        let replset = replset.into();
        let reader = OplogReader::new(url, replset.clone(), shutdown.clone())?;
        Ok(OplogSyncer {
            metric: Arc::new(ReplicationMetric::new(replset.clone())),
            replset,
            reader: Arc::new(reader),
            ckpt_manager: Arc::new(ckpt_manager),
            sentinel,
            rate_controller,
            shutdown,
            stopped: Arc::new(AtomicBool::new(false)),
            filter_chain: Some(filter_chain),
            hasher,
            workers: Vec::new(),
            full_sync_finish,
            partitions: pipeline_queue_count(is_shard_cluster),
            pending_senders: Vec::new(),
            buffer: FetchBuffer::new(fetcher_buffer_capacity),
            next_queue_position: 0,
        })
    }

    /// Bind one worker. A syncer may carry several workers (replica-set
    /// mode); a worker never serves two syncers.
    pub fn bind(&mut self, worker: Arc<Worker>) {
        self.workers.push(worker);
    }

    pub fn metric(&self) -> Arc<ReplicationMetric> {
        self.metric.clone()
    }

    pub fn replset(&self) -> &str {
        &self.replset
    }

    /// Run the tailing loop until shutdown or a fatal source error. Spawns
    /// the deserializer partitions and the batcher task, then polls the
    /// reader whenever this node holds master quorum.
    pub fn start(mut self) -> Result<()> {
        info!(
            replset = %self.replset,
            partitions = self.partitions,
            workers = self.workers.len(),
            "oplog syncer start"
        );

        let mut deserializer_handles = Vec::with_capacity(self.partitions);
        let mut logs_receivers = Vec::with_capacity(self.partitions);
        for index in 0..self.partitions {
            let (pending_tx, pending_rx) = bounded(PIPELINE_QUEUE_LEN);
            let (logs_tx, logs_rx) = bounded(PIPELINE_QUEUE_LEN);
            self.pending_senders.push(pending_tx);
            logs_receivers.push(logs_rx);
            let replset = self.replset.clone();
            deserializer_handles.push(
                thread::Builder::new()
                    .name(format!("deserializer-{}-{}", self.replset, index))
                    .spawn(move || deserializer(replset, index, pending_rx, logs_tx))
                    .expect("spawn deserializer thread"),
            );
        }

        let filter_chain = self.filter_chain.take().unwrap_or_default();
        let batcher = Batcher::new(
            logs_receivers,
            filter_chain,
            self.hasher,
            self.workers.clone(),
            self.full_sync_finish,
        );
        let context = BatchContext {
            replset: self.replset.clone(),
            ckpt_manager: self.ckpt_manager.clone(),
            reader: self.reader.clone(),
            metric: self.metric.clone(),
            worker_num: self.workers.len(),
            shutdown: self.shutdown.clone(),
            stopped: self.stopped.clone(),
        };
        let batcher_handle = thread::Builder::new()
            .name(format!("batcher-{}", self.replset))
            .spawn(move || batcher_loop(batcher, context))
            .expect("spawn batcher thread");

        let mut result = Ok(());
        loop {
            self.poll();
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if self.stopped.load(Ordering::SeqCst) {
                result = Err(SyncError::CollectionCapped {
                    replset: self.replset.clone(),
                });
                break;
            }
            warn!(
                replset = %self.replset,
                master = self.sentinel.is_master(),
                yield_ms = DURATION_TIME_MS,
                "oplog syncer polling yield"
            );
            thread::sleep(Duration::from_millis(DURATION_TIME_MS));
        }

        // drain: stop admitting reads, close the partitions, let the
        // batcher and workers finish their current batches.
        self.pending_senders.clear();
        for handle in deserializer_handles {
            let _ = handle.join();
        }
        self.stopped.store(true, Ordering::SeqCst);
        let _ = batcher_handle.join();
        info!(replset = %self.replset, "oplog syncer stopped");
        result
    }

    /// One master tenure. Reloads the checkpoint (another collector may
    /// have advanced it while we were not master), seeds the reader and
    /// consumes entries until mastership is lost or an error yields.
    fn poll(&mut self) {
        let checkpoint = match self.ckpt_manager.load() {
            Ok((ts, _)) => ts,
            Err(err) => {
                // without a confirmed checkpoint we must not fetch at all.
                error!(replset = %self.replset, %err, "acquire existing checkpoint failed");
                return;
            }
        };
        self.reader.set_query_timestamp_on_empty(checkpoint);
        self.reader.start_fetcher();

        while self.sentinel.is_master() && !self.shutdown.load(Ordering::SeqCst) {
            let budget = self.sentinel.target_tps();
            if budget != 0 && self.rate_controller.control(budget, 1) {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            match self.next() {
                Fetched::Ok => {}
                Fetched::Yield => return,
                Fetched::Fatal => {
                    self.stopped.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    /// Fetch one entry into the buffer; a `None` from the reader is the
    /// flush-on-idle trigger.
    fn next(&mut self) -> Fetched {
        match self.reader.next() {
            Ok(Some(raw)) => {
                self.metric.add_get(1);
                self.metric.clear_fetch_bad();
                self.transfer(Some(raw));
                Fetched::Ok
            }
            Ok(None) => {
                self.transfer(None);
                Fetched::Ok
            }
            Err(SyncError::CollectionCapped { .. }) => {
                error!(
                    replset = %self.replset,
                    "oplog collection capped error, fix the source manually"
                );
                Fetched::Fatal
            }
            Err(err) => {
                error!(replset = %self.replset, %err, "oplog syncer fetch error");
                self.metric.mark_fetch_bad();
                Fetched::Yield
            }
        }
    }

    fn transfer(&mut self, raw: Option<RawDocumentBuf>) {
        if let Some(batch) = self.buffer.push(raw) {
            let selected = (self.next_queue_position % self.partitions as u64) as usize;
            if self.pending_senders[selected].send(batch).is_err() {
                warn!(replset = %self.replset, "pending queue closed, dropping fetch batch");
                return;
            }
            self.next_queue_position += 1;
        }
    }
}

/// Partition task: parse raw batches, keep the raw bytes alongside, push
/// the combined batch downstream. FIFO within the partition by design.
fn deserializer(
    replset: String,
    index: usize,
    pending_rx: Receiver<Vec<RawDocumentBuf>>,
    logs_tx: Sender<Vec<GenericOplog>>,
) {
    for raw_batch in pending_rx.iter() {
        let mut parsed = Vec::with_capacity(raw_batch.len());
        for raw in raw_batch {
            match GenericOplog::parse(raw) {
                Ok(log) => parsed.push(log),
                Err(err) => {
                    error!(%replset, partition = index, %err, "undecodable oplog entry skipped");
                }
            }
        }
        // empty batches must never be enqueued.
        if parsed.is_empty() {
            continue;
        }
        if logs_tx.send(parsed).is_err() {
            return;
        }
    }
}

fn batcher_loop(mut batcher: Batcher, context: BatchContext) {
    let mut filter_flag = false;
    let mut filter_check_ts = Instant::now();

    loop {
        let (batched, barrier, all_empty) = batcher.batch_more();

        if !all_empty {
            let newest = batcher.newest_released();
            if batcher.dispatch_batches(batched) {
                context.metric.set_lsn(timestamp::to_i64(newest));
                context.reader.update_query_timestamp(newest);
            }
            filter_flag = false;
            context.checkpoint(&batcher, barrier, timestamp::ZERO);
            context.check_checkpoint_update(&batcher, barrier, newest);
            continue;
        }

        let (last, last_filtered) = batcher.get_last_oplog();
        let last_ts = last.map(|log| log.ts);
        let filtered_ts = last_filtered.map(|log| log.ts);
        if let Some(filtered_ts) = filtered_ts {
            // the feed may be entirely filtered; without this path the
            // checkpoint would lag forever on a quiet or filtered source.
            if !filter_flag {
                filter_flag = true;
                filter_check_ts = Instant::now();
            } else if filter_check_ts.elapsed()
                >= Duration::from_secs(FILTER_CHECKPOINT_CHECK_INTERVAL_SECS)
            {
                let checkpoint_secs = context
                    .ckpt_manager
                    .get()
                    .map(timestamp::seconds)
                    .unwrap_or(0);
                let filtered_secs = timestamp::seconds(filtered_ts);
                if filtered_secs.saturating_sub(FILTER_CHECKPOINT_GAP_SECS) > checkpoint_secs {
                    info!(
                        replset = %context.replset,
                        ?filtered_ts,
                        checkpoint_secs,
                        "update checkpoint mandatory from filtered oplog"
                    );
                    filter_flag = false;
                    if let Some(last_ts) = last_ts {
                        if filtered_ts <= last_ts {
                            error!(
                                replset = %context.replset,
                                ?filtered_ts,
                                ?last_ts,
                                "filtered timestamp behind the accepted one, skip mandatory flush"
                            );
                            continue;
                        }
                        context.check_checkpoint_update(&batcher, true, last_ts);
                    }
                    context.reader.update_query_timestamp(filtered_ts);
                    context.checkpoint(&batcher, false, filtered_ts);
                }
            }
        }

        if context.stopping() {
            // final flush so a clean shutdown does not replay more than the
            // at-least-once contract requires.
            context.checkpoint(&batcher, true, timestamp::ZERO);
            return;
        }
        thread::sleep(Duration::from_millis(BATCHER_IDLE_SLEEP_MS));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pipeline_queue_count() {
        assert_eq!(pipeline_queue_count(true), PIPELINE_QUEUE_MIN_NR);
        assert_eq!(pipeline_queue_count(false), PIPELINE_QUEUE_MAX_NR);
    }

    #[test]
    fn test_fetch_buffer_flushes_when_full() {
        let mut buffer = FetchBuffer::new(2);
        let raw = || {
            bson::RawDocumentBuf::from_bytes(bson::to_vec(&bson::doc! { "a": 1 }).unwrap())
                .unwrap()
        };
        assert!(buffer.push(Some(raw())).is_none());
        let flushed = buffer.push(Some(raw())).unwrap();
        assert_eq!(flushed.len(), 2);
    }

    #[test]
    fn test_fetch_buffer_flushes_on_idle() {
        // a partial buffer flushes once the feed reports no data.
        let mut buffer = FetchBuffer::new(1024);
        let raw = || {
            bson::RawDocumentBuf::from_bytes(bson::to_vec(&bson::doc! { "a": 1 }).unwrap())
                .unwrap()
        };
        for _ in 0..1023 {
            assert!(buffer.push(Some(raw())).is_none());
        }
        let flushed = buffer.push(None).unwrap();
        assert_eq!(flushed.len(), 1023);
        // an idle tick with an empty buffer stays quiet.
        assert!(buffer.push(None).is_none());
    }
}
