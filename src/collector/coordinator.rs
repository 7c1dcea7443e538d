//! Replication coordinator: validates the deployment, picks the sync mode,
//! runs the full snapshot when needed and then drives one oplog syncer per
//! source with the configured worker group.

use crate::checkpoint::CheckpointManager;
use crate::config::{ReplicatorConfig, ShardKeySpec, SyncMode};
use crate::docsyncer;
use crate::error::{Result, SyncError};
use crate::filter::{FilterChain, NamespaceFilter, OplogFilter};
use crate::namespace::NamespaceTransform;
use crate::oplog::OplogHasher;
use crate::quorum::{Sentinel, SimpleRateController};
use crate::timestamp;
use crate::tunnel::DirectTunnel;
use crate::{ADMIN_DB_NAME, OPLOG_COLL, OPLOG_DB, TIMESTAMP_KEY};
use bson::{doc, Document, Timestamp};
use mongodb::options::FindOneOptions;
use mongodb::sync::{Client, Collection};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use super::syncer::OplogSyncer;
use super::worker::Worker;

/// One source replica set (or one shard of a cluster).
#[derive(Debug, Clone)]
pub struct MongoSource {
    pub url: String,
    pub replica_name: String,
}

/// Oldest and newest oplog timestamps of one source.
#[derive(Debug, Clone, Copy)]
pub struct TimestampNode {
    pub oldest: Timestamp,
    pub newest: Timestamp,
}

pub struct ReplicationCoordinator {
    config: Arc<ReplicatorConfig>,
    sources: Vec<MongoSource>,
    sentinel: Arc<Sentinel>,
    shutdown: Arc<AtomicBool>,
    hasher: OplogHasher,
    trans: Arc<NamespaceTransform>,
}

impl ReplicationCoordinator {
    pub fn new(config: ReplicatorConfig) -> Result<ReplicationCoordinator> {
        config.validate()?;
        let trans = Arc::new(NamespaceTransform::new(&config.transform_namespace)?);
        Ok(ReplicationCoordinator {
            sources: Vec::new(),
            sentinel: Arc::new(Sentinel::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            // refined by sanitize() when the shard key is automatic.
            hasher: match config.shard_key {
                ShardKeySpec::Namespace => OplogHasher::Table,
                _ => OplogHasher::PrimaryKey,
            },
            config: Arc::new(config),
            trans,
        })
    }

    pub fn sentinel(&self) -> Arc<Sentinel> {
        self.sentinel.clone()
    }

    /// Cooperative shutdown: syncers stop admitting reads, partitions
    /// drain, workers finish their current batch.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn run(&mut self) -> Result<()> {
        self.sanitize_mongodb()?;
        info!(
            shard_by = ?self.hasher,
            gids = ?self.config.oplog_gids,
            sources = self.sources.len(),
            "collector startup"
        );

        let (sync_mode, full_begin_ts) = self.select_sync_mode(self.config.sync_mode)?;
        info!(?sync_mode, ?full_begin_ts, "start running");

        match sync_mode {
            SyncMode::All => {
                // newest timestamps captured before the copy: the handoff
                // checkpoint must not skip entries arriving mid-copy.
                let ckpt_map = self.get_all_timestamp()?;
                self.start_document_replication(Some(&ckpt_map))?;
                info!("full sync done");

                let after = self.get_all_timestamp()?;
                let mut full_finish = timestamp::ZERO;
                for source in &self.sources {
                    let node = after.get(&source.replica_name).ok_or_else(|| {
                        SyncError::ConfigError {
                            reason: format!("source {} lost after full sync", source.replica_name),
                        }
                    })?;
                    if node.oldest > full_begin_ts {
                        error!(
                            replset = %source.replica_name,
                            oldest = ?node.oldest,
                            begin = ?full_begin_ts,
                            "oplog rotated past the full sync begin position"
                        );
                        return Err(SyncError::HandoffMissing {
                            replset: source.replica_name.clone(),
                            oldest: node.oldest,
                            begin: full_begin_ts,
                        });
                    }
                    full_finish = full_finish.max(node.newest);
                }
                info!(?full_begin_ts, ?full_finish, "finish full sync, start incr sync");
                self.start_oplog_replication(full_begin_ts, full_finish)
            }
            SyncMode::Document => self.start_document_replication(None),
            SyncMode::Oplog => {
                let start = self
                    .config
                    .context_start_position
                    .map(|secs| Timestamp {
                        time: secs,
                        increment: 0,
                    })
                    .unwrap_or(timestamp::ZERO);
                self.start_oplog_replication(start, start)
            }
        }
    }

    /// Check every deployment endpoint and pin down per-source identities
    /// before anything else runs; all failures here are fatal.
    fn sanitize_mongodb(&mut self) -> Result<()> {
        let storage = Client::with_uri_str(&self.config.context_storage_url)?;
        storage
            .database(ADMIN_DB_NAME)
            .run_command(doc! { "ping": 1 }, None)?;

        let mut seen = HashSet::new();
        let mut has_unique_index = false;
        let mut sources = Vec::with_capacity(self.config.mongo_urls.len());
        for (index, url) in self.config.mongo_urls.iter().enumerate() {
            let client = Client::with_uri_str(url)?;
            let hello = client
                .database(ADMIN_DB_NAME)
                .run_command(doc! { "isMaster": 1 }, None)?;
            client
                .list_database_names(None, None)
                .map_err(|detail| SyncError::PermissionError {
                    uri: url.clone(),
                    db: ADMIN_DB_NAME.to_string(),
                    detail,
                })?;

            if self.config.sync_mode != SyncMode::Document {
                let has_oplog = client
                    .database(OPLOG_DB)
                    .list_collection_names(doc! { "name": OPLOG_COLL })?
                    .iter()
                    .any(|name| name == OPLOG_COLL);
                if !has_oplog {
                    return Err(SyncError::ConfigError {
                        reason: format!("no oplog collection on source {:?}", url),
                    });
                }
            }

            let mut replica_name = hello.get_str("setName").unwrap_or("").to_string();
            if replica_name.is_empty() {
                replica_name = format!("default-{}", index);
                warn!(%url, %replica_name, "source without replica set name, using default");
            }
            if !seen.insert(replica_name.clone()) {
                return Err(SyncError::ConfigError {
                    reason: format!("duplicated replica set name {:?}", replica_name),
                });
            }

            if self.config.shard_key == ShardKeySpec::Automatic && !has_unique_index {
                has_unique_index = source_has_unique_index(&client)?;
            }
            sources.push(MongoSource {
                url: url.clone(),
                replica_name,
            });
        }
        self.sources = sources;

        // collections with a unique index must stay on one worker per
        // namespace, otherwise cross-document ordering could break them.
        if self.config.shard_key == ShardKeySpec::Automatic {
            self.hasher = if has_unique_index {
                OplogHasher::Table
            } else {
                OplogHasher::PrimaryKey
            };
            info!(resolved = ?self.hasher, "automatic shard key resolved");
        }
        Ok(())
    }

    /// `all` downgrades to `oplog` iff every source's stored checkpoint is
    /// strictly newer than its oldest journal entry; otherwise the full
    /// snapshot runs first starting at the oldest timestamp available.
    fn select_sync_mode(&self, mode: SyncMode) -> Result<(SyncMode, Timestamp)> {
        if mode != SyncMode::All {
            return Ok((mode, timestamp::ZERO));
        }
        let ts_map = self.get_all_timestamp()?;
        let storage = Client::with_uri_str(&self.config.context_storage_url)?;
        let mut need_full = false;
        let mut full_begin = None;
        for source in &self.sources {
            let node = ts_map
                .get(&source.replica_name)
                .expect("sanitized source present in timestamp map");
            let manager = self.checkpoint_manager(&storage, &source.replica_name, timestamp::ZERO);
            let (ckpt, exists) = manager.load()?;
            if !exists || node.oldest >= ckpt {
                need_full = true;
            }
            full_begin = Some(match full_begin {
                Some(begin) if begin < node.oldest => begin,
                _ => node.oldest,
            });
        }
        if need_full {
            Ok((SyncMode::All, full_begin.unwrap_or(timestamp::ZERO)))
        } else {
            info!("sync mode change from 'all' to 'oplog'");
            Ok((SyncMode::Oplog, timestamp::ZERO))
        }
    }

    fn get_all_timestamp(&self) -> Result<HashMap<String, TimestampNode>> {
        let mut map = HashMap::with_capacity(self.sources.len());
        for source in &self.sources {
            let client = Client::with_uri_str(&source.url)?;
            let coll: Collection<Document> = client.database(OPLOG_DB).collection(OPLOG_COLL);
            let node = TimestampNode {
                oldest: natural_ts(&coll, 1)?,
                newest: natural_ts(&coll, -1)?,
            };
            map.insert(source.replica_name.clone(), node);
        }
        Ok(map)
    }

    fn start_document_replication(
        &self,
        ckpt_map: Option<&HashMap<String, TimestampNode>>,
    ) -> Result<()> {
        let ns_filter = Arc::new(NamespaceFilter::new(
            self.config.filter_namespace_white.clone(),
            self.config.filter_namespace_black.clone(),
        ));
        docsyncer::start_document_replication(
            &self.config,
            &self.sources,
            self.trans.clone(),
            ns_filter,
        )?;
        if let Some(ckpt_map) = ckpt_map {
            let storage = Client::with_uri_str(&self.config.context_storage_url)?;
            for source in &self.sources {
                if let Some(node) = ckpt_map.get(&source.replica_name) {
                    self.checkpoint_manager(&storage, &source.replica_name, timestamp::ZERO)
                        .install(node.newest)?;
                }
            }
        }
        info!("document syncer sync end");
        Ok(())
    }

    fn start_oplog_replication(
        &self,
        start_position: Timestamp,
        full_sync_finish: Timestamp,
    ) -> Result<()> {
        if self.config.worker_num < self.sources.len() {
            return Err(SyncError::ConfigError {
                reason: format!(
                    "worker_num {} is below the source count {}, some shards would never drain",
                    self.config.worker_num,
                    self.sources.len()
                ),
            });
        }
        let rate_controller = Arc::new(SimpleRateController::new());
        let storage = Client::with_uri_str(&self.config.context_storage_url)?;

        // one syncer per source; worker i serves syncer i % S, so a single
        // replica set spreads over all workers while a sharded cluster gets
        // one worker per shard by default.
        let mut syncers = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let manager =
                self.checkpoint_manager(&storage, &source.replica_name, start_position);
            syncers.push(OplogSyncer::new(
                &source.url,
                source.replica_name.clone(),
                full_sync_finish,
                self.build_filter_chain(),
                self.hasher,
                manager,
                self.sentinel.clone(),
                rate_controller.clone(),
                self.shutdown.clone(),
                self.config.is_shard_cluster(),
                self.config.fetcher_buffer_capacity,
            )?);
        }

        let mut workers = Vec::with_capacity(self.config.worker_num);
        let mut worker_handles = Vec::with_capacity(self.config.worker_num);
        for index in 0..self.config.worker_num {
            let syncer = &mut syncers[index % self.sources.len()];
            let tunnel = Arc::new(DirectTunnel::new(
                &self.config.tunnel_address[0],
                self.trans.clone(),
            )?);
            let (worker, handle) = Worker::start(index as u32, tunnel, syncer.metric());
            syncer.bind(worker.clone());
            workers.push(worker);
            worker_handles.push(handle);
        }

        let mut syncer_handles = Vec::with_capacity(syncers.len());
        for syncer in syncers {
            let name = format!("syncer-{}", syncer.replset());
            syncer_handles.push(
                thread::Builder::new()
                    .name(name)
                    .spawn(move || syncer.start())
                    .expect("spawn syncer thread"),
            );
        }

        let mut result = Ok(());
        for handle in syncer_handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(%err, "oplog syncer terminated");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(_) => {
                    if result.is_ok() {
                        result = Err(SyncError::ChannelClosed);
                    }
                }
            }
        }

        // syncers are gone; release the workers and wait for them to drain.
        drop(workers);
        for handle in worker_handles {
            let _ = handle.join();
        }
        result
    }

    fn build_filter_chain(&self) -> FilterChain {
        let mut filters = vec![
            OplogFilter::Autologous {
                context_db: self.config.context_db.clone(),
            },
            OplogFilter::Noop,
            OplogFilter::Gid(self.config.oplog_gids.iter().cloned().collect()),
        ];
        if self.config.replayer_dml_only {
            filters.push(OplogFilter::Ddl);
        }
        // the namespace scan is the heavy predicate, keep it last.
        if !self.config.filter_namespace_white.is_empty()
            || !self.config.filter_namespace_black.is_empty()
        {
            filters.push(OplogFilter::Namespace(NamespaceFilter::new(
                self.config.filter_namespace_white.clone(),
                self.config.filter_namespace_black.clone(),
            )));
        }
        FilterChain::new(filters)
    }

    fn checkpoint_manager(
        &self,
        storage: &Client,
        replset: &str,
        start_position: Timestamp,
    ) -> CheckpointManager {
        CheckpointManager::new(
            storage,
            &self.config.context_db,
            &self.config.context_collection,
            replset,
            start_position,
            Duration::from_millis(self.config.checkpoint_interval),
        )
    }
}

fn natural_ts(coll: &Collection<Document>, direction: i32) -> Result<Timestamp> {
    coll.find_one(
        None,
        FindOneOptions::builder()
            .sort(doc! { "$natural": direction })
            .build(),
    )?
    .map(|d| d.get_timestamp(TIMESTAMP_KEY).map_err(SyncError::from))
    .unwrap_or_else(|| Err(SyncError::EmptyDocError))
}

/// Whether any user collection carries a unique index besides `_id_`.
fn source_has_unique_index(client: &Client) -> Result<bool> {
    for db_name in client.list_database_names(None, None)? {
        if matches!(db_name.as_str(), "admin" | "local" | "config") {
            continue;
        }
        let db = client.database(&db_name);
        for coll_name in db.list_collection_names(None)? {
            if coll_name.starts_with("system.") {
                continue;
            }
            let result = db.run_command(doc! { "listIndexes": &coll_name }, None)?;
            let batch = result
                .get_document("cursor")
                .and_then(|c| c.get_array("firstBatch"))
                .cloned()
                .unwrap_or_default();
            for index in batch {
                if let bson::Bson::Document(index) = index {
                    if index.get_bool("unique").unwrap_or(false)
                        && index.get_str("name").unwrap_or("") != "_id_"
                    {
                        return Ok(true);
                    }
                }
            }
        }
    }
    Ok(false)
}
