//! Replicator configuration, expressed in toml.
//!
//! Basic configuration file example:
//! ```toml
//! sync_mode = "all"
//! mongo_urls = ["mongodb://localhost:27017/?authSource=admin"]
//! context_storage_url = "mongodb://localhost:27017"
//! tunnel_address = ["mongodb://localhost:27018"]
//!
//! shard_key = "automatic"
//! worker_num = 8
//! filter_namespace_black = ["bb.secret"]
//! transform_namespace = ["bb:bb_copy"]
//! ```

use crate::error::{Result, SyncError};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// full snapshot first, then incremental oplog replay.
    All,
    /// snapshot only.
    Document,
    /// incremental only.
    Oplog,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::All
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardKeySpec {
    /// fan out by `database.collection`.
    Namespace,
    /// fan out by document primary key.
    Id,
    /// resolved at startup: `namespace` if any source collection carries a
    /// non-default unique index, else `id`.
    Automatic,
}

impl Default for ShardKeySpec {
    fn default() -> Self {
        ShardKeySpec::Automatic
    }
}

/// Global replicator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatorConfig {
    /// identity of this replicator, used in checkpoint records and logs.
    #[serde(default = "default_collector_id")]
    pub collector_id: String,
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// source urls; one per replica set, several for a sharded cluster.
    pub mongo_urls: Vec<String>,
    /// where checkpoints are stored; needs to accept durable writes.
    pub context_storage_url: String,
    /// destination urls the tunnel writes to.
    pub tunnel_address: Vec<String>,
    #[serde(default)]
    pub shard_key: ShardKeySpec,
    #[serde(default)]
    pub filter_namespace_white: Vec<String>,
    #[serde(default)]
    pub filter_namespace_black: Vec<String>,
    /// gid allow-list for loop prevention; empty disables gid filtering.
    #[serde(default)]
    pub oplog_gids: Vec<String>,
    /// when true a DDL filter is installed and only DML is replayed.
    #[serde(default = "default_true")]
    pub replayer_dml_only: bool,
    #[serde(default = "default_worker_num")]
    pub worker_num: usize,
    /// raw entries buffered before a batch is pushed into a partition.
    #[serde(default = "default_fetcher_buffer_capacity")]
    pub fetcher_buffer_capacity: usize,
    /// regular checkpoint cadence in milliseconds.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// explicit oplog start position (seconds) for `oplog` mode without a
    /// stored checkpoint.
    #[serde(default)]
    pub context_start_position: Option<u32>,
    #[serde(default = "default_context_db")]
    pub context_db: String,
    #[serde(default = "default_context_collection")]
    pub context_collection: String,
    /// namespaces drained concurrently per source during full sync.
    #[serde(default = "number_of_cpus")]
    pub replayer_collection_parallel: usize,
    /// document executors per namespace during full sync.
    #[serde(default = "half_number_of_cpus")]
    pub replayer_document_parallel: usize,
    /// documents per flush, bounded also by the 16 MiB batch byte cap.
    #[serde(default = "default_document_batch_size")]
    pub replayer_document_batch_size: usize,
    /// drop destination collections before the snapshot.
    #[serde(default)]
    pub replayer_collection_drop: bool,
    /// `src:dst` namespace rewrites.
    #[serde(default)]
    pub transform_namespace: Vec<String>,
    /// rewrite embedded DBRef documents under the namespace transform.
    #[serde(default)]
    pub dbref: bool,
}

fn default_collector_id() -> String {
    "replicator".to_string()
}

fn default_true() -> bool {
    true
}

fn default_worker_num() -> usize {
    8
}

fn default_fetcher_buffer_capacity() -> usize {
    256
}

fn default_checkpoint_interval() -> u64 {
    5000
}

fn default_context_db() -> String {
    "mongo_replicator".to_string()
}

fn default_context_collection() -> String {
    "checkpoint".to_string()
}

fn default_document_batch_size() -> usize {
    128
}

fn number_of_cpus() -> usize {
    num_cpus::get()
}

fn half_number_of_cpus() -> usize {
    (num_cpus::get() / 2).max(1)
}

impl ReplicatorConfig {
    /// Startup validation; any failure here is fatal before a syncer runs.
    pub fn validate(&self) -> Result<()> {
        if self.mongo_urls.is_empty() {
            return Err(config_err("mongo_urls must not be empty"));
        }
        if self.context_storage_url.is_empty() {
            return Err(config_err("context_storage_url must not be empty"));
        }
        if self.tunnel_address.is_empty() {
            return Err(config_err("tunnel_address must not be empty"));
        }
        if self.worker_num == 0 {
            return Err(config_err("worker_num must be at least 1"));
        }
        if self.fetcher_buffer_capacity == 0 {
            return Err(config_err("fetcher_buffer_capacity must be at least 1"));
        }
        if self.replayer_collection_parallel == 0 || self.replayer_document_parallel == 0 {
            return Err(config_err("replayer parallelism must be at least 1"));
        }
        if self.replayer_document_batch_size == 0 {
            return Err(config_err("replayer_document_batch_size must be at least 1"));
        }
        if !self.filter_namespace_white.is_empty() && !self.filter_namespace_black.is_empty() {
            return Err(config_err(
                "filter_namespace_white and filter_namespace_black are exclusive",
            ));
        }
        // surface malformed rewrite rules now instead of mid-sync.
        crate::namespace::NamespaceTransform::new(&self.transform_namespace)?;
        Ok(())
    }

    /// Several sources means every source is one shard of a cluster.
    pub fn is_shard_cluster(&self) -> bool {
        self.mongo_urls.len() > 1
    }
}

fn config_err(reason: &str) -> SyncError {
    SyncError::ConfigError {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            mongo_urls = ["mongodb://localhost:27017"]
            context_storage_url = "mongodb://localhost:27017"
            tunnel_address = ["mongodb://localhost:27018"]
        "#
    }

    #[test]
    fn test_defaults() {
        let conf: ReplicatorConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(conf.sync_mode, SyncMode::All);
        assert_eq!(conf.shard_key, ShardKeySpec::Automatic);
        assert_eq!(conf.worker_num, 8);
        assert_eq!(conf.fetcher_buffer_capacity, 256);
        assert_eq!(conf.checkpoint_interval, 5000);
        assert!(conf.replayer_dml_only);
        assert!(!conf.replayer_collection_drop);
        assert!(conf.validate().is_ok());
        assert!(!conf.is_shard_cluster());
    }

    #[test]
    fn test_mode_and_shard_key_parsing() {
        let conf: ReplicatorConfig = toml::from_str(&format!(
            "{}\nsync_mode = \"oplog\"\nshard_key = \"id\"",
            minimal_toml()
        ))
        .unwrap();
        assert_eq!(conf.sync_mode, SyncMode::Oplog);
        assert_eq!(conf.shard_key, ShardKeySpec::Id);
    }

    #[test]
    fn test_white_black_exclusive() {
        let conf: ReplicatorConfig = toml::from_str(&format!(
            "{}\nfilter_namespace_white = [\"a\"]\nfilter_namespace_black = [\"b\"]",
            minimal_toml()
        ))
        .unwrap();
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_bad_transform_rule_is_fatal() {
        let conf: ReplicatorConfig = toml::from_str(&format!(
            "{}\ntransform_namespace = [\"missing-colon\"]",
            minimal_toml()
        ))
        .unwrap();
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_zero_worker_num_rejected() {
        let conf: ReplicatorConfig =
            toml::from_str(&format!("{}\nworker_num = 0", minimal_toml())).unwrap();
        assert!(conf.validate().is_err());
    }
}
