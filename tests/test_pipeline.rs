//! Pipeline scenarios: batcher fan-out through real workers into a
//! recording tunnel, against in-memory partition queues.

use bson::{doc, Document, RawDocumentBuf, Timestamp};
use crossbeam::channel::{bounded, Sender};
use mongo_replicator::collector::batcher::Batcher;
use mongo_replicator::collector::worker::Worker;
use mongo_replicator::filter::{FilterChain, NamespaceFilter, OplogFilter};
use mongo_replicator::metrics::ReplicationMetric;
use mongo_replicator::oplog::{GenericOplog, OplogEntry, OplogHasher, OpType};
use mongo_replicator::timestamp;
use mongo_replicator::tunnel::Tunnel;
use mongo_replicator::{Result, PIPELINE_QUEUE_LEN};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Tunnel that records which worker delivered which timestamps.
#[derive(Default)]
struct RecordingTunnel {
    deliveries: Mutex<Vec<(u32, Vec<Timestamp>)>>,
}

struct WorkerTunnel {
    worker_id: u32,
    shared: Arc<RecordingTunnel>,
}

impl Tunnel for WorkerTunnel {
    fn send(&self, batch: &[GenericOplog]) -> Result<()> {
        self.shared.deliveries.lock().unwrap().push((
            self.worker_id,
            batch.iter().map(|log| log.parsed.ts).collect(),
        ));
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

struct Context {
    tunnel: Arc<RecordingTunnel>,
    workers: Vec<Arc<Worker>>,
    handles: Vec<JoinHandle<()>>,
    queues: Vec<Sender<Vec<GenericOplog>>>,
    batcher: Batcher,
}

impl Context {
    fn new(worker_count: usize, queue_count: usize, hasher: OplogHasher, chain: FilterChain) -> Context {
        let tunnel = Arc::new(RecordingTunnel::default());
        let metric = Arc::new(ReplicationMetric::new("rs-test"));
        let (workers, handles): (Vec<_>, Vec<_>) = (0..worker_count as u32)
            .map(|id| {
                Worker::start(
                    id,
                    Arc::new(WorkerTunnel {
                        worker_id: id,
                        shared: tunnel.clone(),
                    }),
                    metric.clone(),
                )
            })
            .unzip();
        let (queues, receivers): (Vec<_>, Vec<_>) =
            (0..queue_count).map(|_| bounded(PIPELINE_QUEUE_LEN)).unzip();
        let batcher = Batcher::new(receivers, chain, hasher, workers.clone(), timestamp::ZERO);
        Context {
            tunnel,
            workers,
            handles,
            queues,
            batcher,
        }
    }

    fn finish(self) -> Vec<(u32, Vec<Timestamp>)> {
        let Context {
            tunnel,
            workers,
            handles,
            queues,
            batcher,
        } = self;
        drop(batcher);
        drop(workers);
        drop(queues);
        for handle in handles {
            handle.join().unwrap();
        }
        let deliveries = tunnel.deliveries.lock().unwrap();
        deliveries.clone()
    }

    fn wait_min_ack(&self, want: Timestamp) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let min_ack = self.workers.iter().map(|w| w.ack_lsn()).min().unwrap();
            if min_ack >= timestamp::to_i64(want) || Instant::now() > deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

#[test]
fn test_ddl_barrier_reaches_every_worker() {
    // insert@10001, insert@10002, createIndex@10003 (DDL), insert@10004
    // with four workers sharded by primary key.
    let mut context = Context::new(4, 1, OplogHasher::PrimaryKey, FilterChain::default());
    context.queues[0]
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

    let (batched, barrier, all_empty) = context.batcher.batch_more();
    assert!(barrier && !all_empty);
    assert!(context.batcher.dispatch_batches(batched));
    let barrier_ts = Timestamp {
        time: 10003,
        increment: 0,
    };
    // every worker acknowledges the barrier before anything later flows.
    context.wait_min_ack(barrier_ts);

    let (batched, barrier, all_empty) = context.batcher.batch_more();
    assert!(!barrier && !all_empty);
    assert!(context.batcher.dispatch_batches(batched));

    let deliveries = context.finish();
    // all four workers saw the barrier entry.
    let mut barrier_workers: Vec<u32> = deliveries
        .iter()
        .filter(|(_, tss)| tss.contains(&barrier_ts))
        .map(|(w, _)| *w)
        .collect();
    barrier_workers.sort_unstable();
    barrier_workers.dedup();
    assert_eq!(barrier_workers, vec![0, 1, 2, 3]);
    // nobody observed insert@10004 in the same delivery as the barrier or
    // before it.
    for (_, tss) in &deliveries {
        if let Some(pos) = tss.iter().position(|t| t.time == 10004) {
            assert!(tss[..pos].iter().all(|t| *t <= barrier_ts));
        }
    }
}

#[test]
fn test_per_worker_fifo_order() {
    let mut context = Context::new(2, 1, OplogHasher::PrimaryKey, FilterChain::default());
    for round in 0..20u32 {
        context.queues[0]
            .send(vec![
                oplog(OpType::Insert, 100 + round, 1, "bb.items", doc! { "_id": 1 }),
                oplog(OpType::Insert, 100 + round, 2, "bb.items", doc! { "_id": 2 }),
            ])
            .unwrap();
        let (batched, _, _) = context.batcher.batch_more();
        context.batcher.dispatch_batches(batched);
    }
    let deliveries = context.finish();
    // flatten per worker and require monotone timestamps.
    for worker in 0..2u32 {
        let seen: Vec<Timestamp> = deliveries
            .iter()
            .filter(|(w, _)| *w == worker)
            .flat_map(|(_, tss)| tss.iter().copied())
            .collect();
        assert!(
            seen.windows(2).all(|w| w[0] < w[1]),
            "worker {} broke FIFO: {:?}",
            worker,
            seen
        );
    }
}

#[test]
fn test_filter_closure_no_worker_sees_filtered_entries() {
    // a blacklisted namespace never reaches any worker, while the batcher
    // still tracks the newest filtered timestamp for the mandatory
    // checkpoint advance.
    let chain = FilterChain::new(vec![OplogFilter::Namespace(NamespaceFilter::new(
        vec![],
        vec!["blacked".to_string()],
    ))]);
    let mut context = Context::new(2, 1, OplogHasher::PrimaryKey, chain);
    for i in 0..50u32 {
        context.queues[0]
            .send(vec![oplog(
                OpType::Insert,
                10004 + i * 4,
                if i == 49 { 5 } else { 0 },
                "blacked.items",
                doc! { "_id": i as i32 },
            )])
            .unwrap();
    }
    let (batched, barrier, all_empty) = context.batcher.batch_more();
    assert!(all_empty && !barrier);
    assert!(!context.batcher.dispatch_batches(batched));
    let (last, filtered) = context.batcher.get_last_oplog();
    assert!(last.is_none());
    assert_eq!(
        filtered.unwrap().ts,
        Timestamp {
            time: 10200,
            increment: 5
        }
    );
    let deliveries = context.finish();
    assert!(deliveries.is_empty());
}

#[test]
fn test_namespace_hash_keeps_collection_on_one_worker() {
    let mut context = Context::new(4, 1, OplogHasher::Table, FilterChain::default());
    for i in 0..12i32 {
        context.queues[0]
            .send(vec![oplog(
                OpType::Insert,
                2000 + i as u32,
                0,
                "bb.items",
                doc! { "_id": i },
            )])
            .unwrap();
        let (batched, _, _) = context.batcher.batch_more();
        context.batcher.dispatch_batches(batched);
    }
    let deliveries = context.finish();
    let workers: Vec<u32> = deliveries.iter().map(|(w, _)| *w).collect();
    assert!(!workers.is_empty());
    assert!(workers.iter().all(|w| *w == workers[0]));
}

#[test]
fn test_sharded_single_partition_keeps_order_across_batches() {
    // with one partition and one worker the whole feed is FIFO end to end.
    let mut context = Context::new(1, 1, OplogHasher::PrimaryKey, FilterChain::default());
    let mut expect = Vec::new();
    for second in 0..10u32 {
        let mut batch = Vec::new();
        for increment in 0..10u32 {
            let ts = Timestamp {
                time: 5000 + second,
                increment,
            };
            expect.push(ts);
            batch.push(oplog(
                OpType::Insert,
                ts.time,
                ts.increment,
                "bb.items",
                doc! { "_id": (second * 10 + increment) as i32 },
            ));
        }
        context.queues[0].send(batch).unwrap();
    }
    let (batched, _, _) = context.batcher.batch_more();
    context.batcher.dispatch_batches(batched);
    context.wait_min_ack(*expect.last().unwrap());
    let deliveries = context.finish();
    let seen: Vec<Timestamp> = deliveries
        .into_iter()
        .flat_map(|(_, tss)| tss)
        .collect();
    assert_eq!(seen, expect);
}
