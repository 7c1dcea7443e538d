//! Per-syncer replication counters and the status snapshot they produce.
//! Counters are plain atomics: every writer is a single pipeline task, the
//! snapshot is the only multi-reader.

use crate::timestamp;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

pub struct ReplicationMetric {
    replset: String,
    logs_get: AtomicU64,
    logs_repl: AtomicU64,
    logs_success: AtomicU64,
    fetch_bad: AtomicBool,
    lsn: AtomicI64,
    lsn_ack: AtomicI64,
    lsn_ckpt: AtomicI64,
    tps_window: Mutex<TpsWindow>,
}

struct TpsWindow {
    at: Instant,
    success: u64,
}

impl ReplicationMetric {
    pub fn new(replset: impl Into<String>) -> ReplicationMetric {
        ReplicationMetric {
            replset: replset.into(),
            logs_get: AtomicU64::new(0),
            logs_repl: AtomicU64::new(0),
            logs_success: AtomicU64::new(0),
            fetch_bad: AtomicBool::new(false),
            lsn: AtomicI64::new(0),
            lsn_ack: AtomicI64::new(0),
            lsn_ckpt: AtomicI64::new(0),
            tps_window: Mutex::new(TpsWindow {
                at: Instant::now(),
                success: 0,
            }),
        }
    }

    pub fn replset(&self) -> &str {
        &self.replset
    }

    pub fn add_get(&self, n: u64) {
        self.logs_get.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_apply(&self, n: u64) {
        self.logs_repl.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_success(&self, n: u64) {
        self.logs_success.fetch_add(n, Ordering::Relaxed);
    }

    pub fn mark_fetch_bad(&self) {
        self.fetch_bad.store(true, Ordering::Relaxed);
    }

    pub fn clear_fetch_bad(&self) {
        self.fetch_bad.store(false, Ordering::Relaxed);
    }

    pub fn is_fetch_bad(&self) -> bool {
        self.fetch_bad.load(Ordering::Relaxed)
    }

    pub fn set_lsn(&self, lsn: i64) {
        self.lsn.fetch_max(lsn, Ordering::Relaxed);
    }

    pub fn set_lsn_ack(&self, lsn: i64) {
        self.lsn_ack.fetch_max(lsn, Ordering::Relaxed);
    }

    pub fn set_lsn_ckpt(&self, lsn: i64) {
        self.lsn_ckpt.fetch_max(lsn, Ordering::Relaxed);
    }

    /// Replayed entries per second since the previous tps sample.
    pub fn tps(&self) -> u64 {
        let success = self.logs_success.load(Ordering::Relaxed);
        let mut window = self.tps_window.lock().expect("tps window lock");
        let elapsed = window.at.elapsed().as_secs();
        if elapsed == 0 {
            return 0;
        }
        let tps = success.saturating_sub(window.success) / elapsed;
        window.at = Instant::now();
        window.success = success;
        tps
    }

    pub fn snapshot(&self, tag: &str) -> ReplicationStatus {
        ReplicationStatus {
            tag: tag.to_string(),
            replset: self.replset.clone(),
            logs_get: self.logs_get.load(Ordering::Relaxed),
            logs_repl: self.logs_repl.load(Ordering::Relaxed),
            logs_success: self.logs_success.load(Ordering::Relaxed),
            tps: self.tps(),
            lsn: MongoTime::from_packed(self.lsn.load(Ordering::Relaxed)),
            lsn_ack: MongoTime::from_packed(self.lsn_ack.load(Ordering::Relaxed)),
            lsn_ckpt: MongoTime::from_packed(self.lsn_ckpt.load(Ordering::Relaxed)),
            now: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// A timestamp rendered for humans and machines at once.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MongoTime {
    pub ts: i64,
    pub unix: i64,
    pub time: String,
}

impl MongoTime {
    fn from_packed(lsn: i64) -> MongoTime {
        let ts = timestamp::from_i64(lsn);
        MongoTime {
            ts: lsn,
            unix: ts.time as i64,
            time: timestamp::to_string(&ts),
        }
    }
}

/// Per-source status snapshot; serialized as the JSON body of the status
/// endpoint contract.
#[derive(Debug, Serialize)]
pub struct ReplicationStatus {
    pub tag: String,
    pub replset: String,
    pub logs_get: u64,
    pub logs_repl: u64,
    pub logs_success: u64,
    pub tps: u64,
    pub lsn: MongoTime,
    pub lsn_ack: MongoTime,
    pub lsn_ckpt: MongoTime,
    pub now: String,
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::Timestamp;

    #[test]
    fn test_counters_accumulate() {
        let m = ReplicationMetric::new("shard-a");
        m.add_get(10);
        m.add_get(5);
        m.add_apply(7);
        m.add_success(7);
        let snap = m.snapshot("test");
        assert_eq!(snap.logs_get, 15);
        assert_eq!(snap.logs_repl, 7);
        assert_eq!(snap.logs_success, 7);
        assert_eq!(snap.replset, "shard-a");
    }

    #[test]
    fn test_lsn_never_regresses() {
        let m = ReplicationMetric::new("shard-a");
        let high = timestamp::to_i64(Timestamp {
            time: 200,
            increment: 0,
        });
        let low = timestamp::to_i64(Timestamp {
            time: 100,
            increment: 0,
        });
        m.set_lsn(high);
        m.set_lsn(low);
        assert_eq!(m.snapshot("t").lsn.ts, high);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = ReplicationMetric::new("shard-a");
        let json = serde_json::to_value(m.snapshot("tag1")).unwrap();
        assert_eq!(json["replset"], "shard-a");
        assert_eq!(json["tag"], "tag1");
        assert!(json["lsn"]["ts"].is_i64());
    }
}
