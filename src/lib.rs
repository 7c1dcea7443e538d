//! MongoDB change-data-capture replicator.
//!
//! Two cores share this crate: a full-snapshot collection copier
//! ([docsyncer]) and an incremental oplog tailer ([collector]) that fetches
//! raw oplog entries, deserializes them in parallel, batches them, fans them
//! out to workers by a stable hash and persists checkpoints with ordering
//! guarantees that survive restarts. They meet at a single boundary: the
//! timestamp installed when the full snapshot hands off to the tailer.

pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod docsyncer;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod namespace;
pub mod oplog;
pub mod quorum;
pub mod timestamp;
pub mod tunnel;

pub const ADMIN_DB_NAME: &str = "admin";
pub const OPLOG_DB: &str = "local";
pub const OPLOG_COLL: &str = "oplog.rs";

// oplog relative keys.
pub const NAMESPACE_KEY: &str = "ns";
pub const TIMESTAMP_KEY: &str = "ts";
pub const OP_KEY: &str = "op";
pub const OBJECT_KEY: &str = "o";
pub const OBJECT2_KEY: &str = "o2";
pub const GID_KEY: &str = "g";

// bson deserialize workload is CPU-intensive, so raw batches are spread
// over several partitions unless the source is already sharded.
pub const PIPELINE_QUEUE_MAX_NR: usize = 4;
pub const PIPELINE_QUEUE_MIN_NR: usize = 1;
pub const PIPELINE_QUEUE_LEN: usize = 64;

/// Polling yield interval after a fetch error or a master hand-off. unit: ms.
pub const DURATION_TIME_MS: u64 = 6000;
/// Re-flush interval while waiting for a barrier checkpoint. unit: ms.
pub const DDL_CHECKPOINT_INTERVAL_MS: u64 = 300;
/// Logical-time lead a filtered entry must have before a mandatory
/// checkpoint flush. unit: seconds.
pub const FILTER_CHECKPOINT_GAP_SECS: u32 = 180;
/// How long the feed must be entirely filtered before the mandatory flush
/// is considered. unit: seconds.
pub const FILTER_CHECKPOINT_CHECK_INTERVAL_SECS: u64 = 180;

/// Hard cap of one document batch handed to the destination.
pub const MAX_BUFFER_BYTE_SIZE: usize = 16 * 1024 * 1024;
/// Max number of entries merged out of the logs queues per batching pass.
pub const ADAPTIVE_BATCHING_MAX_SIZE: usize = 16384;

pub use collector::coordinator::ReplicationCoordinator;
pub use config::{ReplicatorConfig, ShardKeySpec, SyncMode};
pub use error::{Result, SyncError};
pub use namespace::{NamespaceTransform, Ns};
pub use oplog::{GenericOplog, OplogEntry, OpType};
