//! Oplog timestamp helpers.
//!
//! A `bson::Timestamp` carries seconds since epoch in the high 32 bits and a
//! per-second counter in the low 32 bits. The derived ordering is the
//! unsigned comparison the oplog relies on. Packing into an `i64` lets the
//! pipeline keep LSN values in atomic cells.

use bson::Timestamp;
use chrono::{DateTime, Local, TimeZone};

/// The "unset" sentinel. Every real oplog entry is strictly greater.
pub const ZERO: Timestamp = Timestamp {
    time: 0,
    increment: 0,
};

/// Pack a timestamp into an i64 preserving order.
pub fn to_i64(ts: Timestamp) -> i64 {
    ((ts.time as i64) << 32) | ts.increment as i64
}

/// Inverse of [to_i64].
pub fn from_i64(v: i64) -> Timestamp {
    Timestamp {
        time: (v >> 32) as u32,
        increment: v as u32,
    }
}

/// Wall-clock seconds of `ts`.
pub fn seconds(ts: Timestamp) -> u32 {
    ts.time
}

pub fn to_datetime(ts: &Timestamp) -> Option<DateTime<Local>> {
    Local.timestamp_opt(ts.time as i64, 0).single()
}

/// Render `ts` for the status snapshot.
pub fn to_string(ts: &Timestamp) -> String {
    match to_datetime(ts) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::from("-"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pack_roundtrip() {
        let ts = Timestamp {
            time: 10200,
            increment: 5,
        };
        assert_eq!(from_i64(to_i64(ts)), ts);
        assert_eq!(from_i64(0), ZERO);
    }

    #[test]
    fn test_pack_preserves_order() {
        let a = Timestamp {
            time: 10000,
            increment: 9,
        };
        let b = Timestamp {
            time: 10001,
            increment: 0,
        };
        let c = Timestamp {
            time: 10001,
            increment: 1,
        };
        assert!(to_i64(a) < to_i64(b));
        assert!(to_i64(b) < to_i64(c));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_seconds_extraction() {
        let ts = Timestamp {
            time: 1234,
            increment: 77,
        };
        assert_eq!(seconds(ts), 1234);
    }
}
