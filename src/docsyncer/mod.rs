//! Full-snapshot replication core.
//!
//! One DB syncer per source drains its namespaces into collection
//! executors; after every source finishes, indexes are created best-effort
//! and the coordinator installs the handoff checkpoints so the incremental
//! core can resume without gaps.

pub mod db_syncer;
pub mod executor;
pub mod reader;

use crate::config::ReplicatorConfig;
use crate::error::{cmd_result_is_ok, Result, SyncError};
use crate::filter::NamespaceFilter;
use crate::namespace::{DbTransform, NamespaceTransform, Ns};
use bson::{doc, Document};
use mongodb::sync::Client;
use rayon::ThreadPoolBuilder;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

use crate::collector::coordinator::MongoSource;
use db_syncer::{get_db_namespaces, DbSyncer};

/// Run the document replication phase across all sources.
pub fn start_document_replication(
    config: &Arc<ReplicatorConfig>,
    sources: &[MongoSource],
    trans: Arc<NamespaceTransform>,
    ns_filter: Arc<NamespaceFilter>,
) -> Result<()> {
    let to_url = &config.tunnel_address[0];
    let to_conn = Client::with_uri_str(to_url)?;

    let mut ns_set: HashSet<Ns> = HashSet::new();
    for source in sources {
        let client = Client::with_uri_str(&source.url)?;
        ns_set.extend(get_db_namespaces(&client, &ns_filter)?);
    }

    let from_is_sharding = sources.len() > 1;
    let sharding_sync = is_sharding_to_sharding(from_is_sharding, &to_conn);
    let ns_existed = start_drop_dest_collection(
        &ns_set,
        &to_conn,
        &trans,
        config.replayer_collection_drop,
    )?;
    if sharding_sync {
        start_namespace_spec_sync_for_sharding(
            &config.context_storage_url,
            &to_conn,
            &ns_existed,
            &trans,
            &DbTransform::new(&config.transform_namespace)?,
            &ns_filter,
        )?;
    }

    // one thread per source; the per-source fan-out happens inside each
    // DB syncer.
    let mut handles = Vec::with_capacity(sources.len());
    for (id, source) in sources.iter().enumerate() {
        let syncer = DbSyncer::new(
            id,
            source.url.clone(),
            to_url.clone(),
            trans.clone(),
            ns_filter.clone(),
            config.clone(),
        );
        info!(syncer = id, url = %source.url, "document syncer do replication");
        handles.push(
            thread::Builder::new()
                .name(format!("db-syncer-{}", id))
                .spawn(move || syncer.start())
                .expect("spawn db syncer thread"),
        );
    }

    let mut index_map: HashMap<Ns, Vec<Document>> = HashMap::new();
    let mut first_error = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(map)) => index_map.extend(map),
            Ok(Err(err)) => {
                error!(%err, "document replication for one source failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(_) => {
                if first_error.is_none() {
                    first_error = Some(SyncError::ChannelClosed);
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    start_index_sync(
        index_map,
        to_url,
        &ns_existed,
        &trans,
        config.replayer_collection_parallel,
    )?;
    Ok(())
}

/// Sharding-aware behavior only kicks in for sharded → sharded setups.
pub fn is_sharding_to_sharding(from_is_sharding: bool, to_conn: &Client) -> bool {
    let to_is_sharding = to_conn
        .database("config")
        .collection::<Document>("version")
        .find_one(None, None)
        .map(|v| v.is_some())
        .unwrap_or(false);
    match (from_is_sharding, to_is_sharding) {
        (true, true) => {
            info!("replication from sharding to sharding");
            true
        }
        (true, false) => {
            info!("replication from sharding to replica");
            false
        }
        (false, true) => {
            info!("replication from replica to sharding");
            false
        }
        (false, false) => {
            info!("replication from replica to replica");
            false
        }
    }
}

/// Drop destination collections, or detect which namespaces already exist.
/// An existing namespace still receives data but keeps its collection and
/// index specs.
pub fn start_drop_dest_collection(
    ns_set: &HashSet<Ns>,
    to_conn: &Client,
    trans: &NamespaceTransform,
    collection_drop: bool,
) -> Result<HashSet<String>> {
    let mut ns_existed = HashSet::new();
    for ns in ns_set {
        let to_ns = trans.transform_ns(ns);
        if !collection_drop {
            let existing = to_conn
                .database(&to_ns.database)
                .list_collection_names(doc! { "name": &to_ns.collection })?;
            if !existing.is_empty() {
                warn!(
                    ns = %to_ns,
                    "namespace already exists on destination, collection and index specs will not be synced"
                );
                ns_existed.insert(ns.str());
            }
        } else {
            let result = to_conn
                .database(&to_ns.database)
                .collection::<Document>(&to_ns.collection)
                .drop(None);
            if !cmd_result_is_ok(&result, "ns not found") {
                error!(ns = %to_ns, "drop collection on destination failed");
                result?;
            }
        }
    }
    Ok(ns_existed)
}

/// Sharding → sharding only: replay database partitioning and collection
/// shard keys from the source config server onto the destination.
pub fn start_namespace_spec_sync_for_sharding(
    cs_url: &str,
    to_conn: &Client,
    ns_existed: &HashSet<String>,
    trans: &NamespaceTransform,
    db_trans: &DbTransform,
    ns_filter: &NamespaceFilter,
) -> Result<()> {
    info!("document syncer namespace spec for sharding begin");
    let from_conn = Client::with_uri_str(cs_url)?;

    let databases = from_conn
        .database("config")
        .collection::<Document>("databases")
        .find(None, None)?;
    for spec in databases {
        let spec = spec?;
        if !spec.get_bool("partitioned").unwrap_or(false) {
            continue;
        }
        let db = spec.get_str("_id")?;
        if ns_filter.filter_ns(&format!("{}.$cmd", db)) {
            info!(%db, "partitioned database is filtered");
            continue;
        }
        for to_db in db_trans.transform(db) {
            let already = to_conn
                .database("config")
                .collection::<Document>("databases")
                .find_one(doc! { "_id": &to_db }, None)?
                .map(|d| d.get_bool("partitioned").unwrap_or(false))
                .unwrap_or(false);
            if already {
                continue;
            }
            to_conn
                .database(crate::ADMIN_DB_NAME)
                .run_command(doc! { "enablesharding": &to_db }, None)
                .map_err(|err| {
                    error!(%to_db, %err, "enable sharding on destination failed");
                    SyncError::from(err)
                })?;
            info!(%to_db, "enable sharding on destination successful");
        }
    }

    let collections = from_conn
        .database("config")
        .collection::<Document>("collections")
        .find(None, None)?;
    for spec in collections {
        let spec = spec?;
        let ns = spec.get_str("_id")?;
        if ns_existed.contains(ns) {
            info!(%ns, "namespace spec sync is skipped");
            continue;
        }
        if spec.get_bool("dropped").unwrap_or(false) {
            continue;
        }
        if ns_filter.filter_ns(ns) {
            info!(%ns, "sharded namespace is filtered");
            continue;
        }
        let key = spec.get_document("key")?.clone();
        let unique = spec.get_bool("unique").unwrap_or(false);
        let to_ns = trans.transform(ns);
        to_conn
            .database(crate::ADMIN_DB_NAME)
            .run_command(
                doc! { "shardCollection": &to_ns, "key": key, "unique": unique },
                None,
            )
            .map_err(|err| {
                error!(%to_ns, %err, "shard collection on destination failed");
                SyncError::from(err)
            })?;
        info!(%to_ns, "shard collection on destination successful");
    }

    info!("document syncer namespace spec for sharding successful");
    Ok(())
}

/// Create the collected indexes on the destination, in parallel and best
/// effort: a failed index never blocks the checkpoint handoff.
pub fn start_index_sync(
    index_map: HashMap<Ns, Vec<Document>>,
    to_url: &str,
    ns_existed: &HashSet<String>,
    trans: &NamespaceTransform,
    collection_parallel: usize,
) -> Result<()> {
    info!("document syncer sync index begin");
    if index_map.is_empty() {
        info!("document syncer sync index finish, but no data");
        return Ok(());
    }
    let conn = Client::with_uri_str(to_url)?;
    let pool = ThreadPoolBuilder::new()
        .num_threads(collection_parallel)
        .thread_name(|i| format!("index-sync-{}", i))
        .build()
        .expect("build index sync pool");

    pool.scope(|scope| {
        for (ns, index_list) in &index_map {
            if ns_existed.contains(&ns.str()) {
                info!(ns = %ns.str(), "index sync skipped, namespace existed");
                continue;
            }
            let conn = conn.clone();
            scope.spawn(move |_| {
                let to_ns = trans.transform_ns(ns);
                for index in index_list {
                    let mut index = index.clone();
                    // the replicator must not wait behind a background build.
                    index.insert("background", false);
                    index.remove("ns");
                    let result = conn.database(&to_ns.database).run_command(
                        doc! {
                            "createIndexes": &to_ns.collection,
                            "indexes": [index],
                        },
                        None,
                    );
                    if let Err(err) = result {
                        warn!(ns = %to_ns, %err, "create index on destination failed");
                    }
                }
                info!(ns = %to_ns, "create indexes on destination finish");
            });
        }
    });
    info!("document syncer sync index finish");
    Ok(())
}
