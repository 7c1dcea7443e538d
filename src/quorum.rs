//! Master election status and the per-coordinator rate pacer.
//!
//! The election transport itself lives outside this crate; syncers only
//! consult the flags. Several replicators may run against the same sources,
//! and only the quorum master actively polls the oplog.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Sentinel {
    master: AtomicBool,
    target_tps: AtomicU64,
}

impl Default for Sentinel {
    fn default() -> Self {
        Sentinel {
            // a standalone replicator is its own master.
            master: AtomicBool::new(true),
            target_tps: AtomicU64::new(0),
        }
    }
}

impl Sentinel {
    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::Relaxed)
    }

    pub fn set_master(&self, master: bool) {
        self.master.store(master, Ordering::Relaxed);
    }

    /// 0 means unlimited.
    pub fn target_tps(&self) -> u64 {
        self.target_tps.load(Ordering::Relaxed)
    }

    pub fn set_target_tps(&self, tps: u64) {
        self.target_tps.store(tps, Ordering::Relaxed);
    }
}

/// A pacer, not a load shedder: callers over budget sleep and retry.
#[derive(Debug)]
pub struct SimpleRateController {
    window: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    start: Instant,
    count: u64,
}

impl Default for SimpleRateController {
    fn default() -> Self {
        SimpleRateController {
            window: Mutex::new(RateWindow {
                start: Instant::now(),
                count: 0,
            }),
        }
    }
}

impl SimpleRateController {
    pub fn new() -> SimpleRateController {
        SimpleRateController::default()
    }

    /// Account `n` events against a per-second `budget`. Returns true when
    /// over budget, in which case nothing was accounted.
    pub fn control(&self, budget: u64, n: u64) -> bool {
        if budget == 0 {
            return false;
        }
        let mut window = self.window.lock().expect("rate window lock");
        if window.start.elapsed() >= Duration::from_secs(1) {
            window.start = Instant::now();
            window.count = 0;
        }
        if window.count + n > budget {
            return true;
        }
        window.count += n;
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sentinel_flags() {
        let s = Sentinel::default();
        assert!(s.is_master());
        s.set_master(false);
        assert!(!s.is_master());
        assert_eq!(s.target_tps(), 0);
        s.set_target_tps(500);
        assert_eq!(s.target_tps(), 500);
    }

    #[test]
    fn test_rate_controller_budget() {
        let rc = SimpleRateController::new();
        assert!(!rc.control(0, 1)); // unlimited
        assert!(!rc.control(2, 1));
        assert!(!rc.control(2, 1));
        assert!(rc.control(2, 1)); // third event in the window is over budget
    }
}
