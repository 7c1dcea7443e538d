//! Incremental oplog replication core: reader, deserializer partitions,
//! batcher, workers and the per-source syncer that wires them together,
//! orchestrated by the coordinator.

pub mod batcher;
pub mod coordinator;
pub mod reader;
pub mod syncer;
pub mod worker;

pub use batcher::Batcher;
pub use coordinator::ReplicationCoordinator;
pub use reader::OplogReader;
pub use syncer::OplogSyncer;
pub use worker::Worker;
