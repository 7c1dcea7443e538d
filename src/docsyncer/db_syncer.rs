//! Per-source document syncer: enumerates the namespaces to copy and drains
//! them with a bounded pool of collection workers.

use crate::config::ReplicatorConfig;
use crate::docsyncer::executor::{generate_coll_executor_id, CollectionExecutor};
use crate::docsyncer::reader::DocumentReader;
use crate::error::{Result, SyncError};
use crate::filter::NamespaceFilter;
use crate::namespace::{transform_dbref, NamespaceTransform, Ns};
use crate::MAX_BUFFER_BYTE_SIZE;
use bson::{Document, RawDocumentBuf};
use crossbeam::channel;
use mongodb::sync::Client;
use rayon::ThreadPoolBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

pub struct DbSyncer {
    id: usize,
    from_url: String,
    to_url: String,
    trans: Arc<NamespaceTransform>,
    ns_filter: Arc<NamespaceFilter>,
    config: Arc<ReplicatorConfig>,
}

enum CollectionStatus {
    Done(Ns, Vec<Document>),
    Failed(SyncError),
}

impl DbSyncer {
    pub fn new(
        id: usize,
        from_url: String,
        to_url: String,
        trans: Arc<NamespaceTransform>,
        ns_filter: Arc<NamespaceFilter>,
        config: Arc<ReplicatorConfig>,
    ) -> DbSyncer {
        DbSyncer {
            id,
            from_url,
            to_url,
            trans,
            ns_filter,
            config,
        }
    }

    /// Copy every namespace of this source. Remaining namespaces continue
    /// after one fails; the first error is reported. Returns the collected
    /// index map for the later index sync.
    pub fn start(&self) -> Result<HashMap<Ns, Vec<Document>>> {
        let from_client = Client::with_uri_str(&self.from_url)?;
        let to_client = Client::with_uri_str(&self.to_url)?;

        let ns_list = get_db_namespaces(&from_client, &self.ns_filter)?;
        if ns_list.is_empty() {
            info!(syncer = self.id, "document syncer finish, but no data");
            return Ok(HashMap::new());
        }
        let total = ns_list.len();

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.replayer_collection_parallel)
            .thread_name(|i| format!("coll-sync-{}", i))
            .build()
            .expect("build collection sync pool");
        let (status_tx, status_rx) = channel::bounded(self.config.replayer_collection_parallel);

        for ns in ns_list {
            let status_tx = status_tx.clone();
            let from_client = from_client.clone();
            let to_client = to_client.clone();
            let trans = self.trans.clone();
            let config = self.config.clone();
            let syncer_id = self.id;
            pool.spawn(move || {
                let executor_id = generate_coll_executor_id();
                let to_ns = trans.transform_ns(&ns);
                info!(
                    syncer = syncer_id,
                    executor = executor_id,
                    from = %ns,
                    to = %to_ns,
                    "collection sync begin"
                );
                let status = match collection_sync(
                    executor_id,
                    &from_client,
                    &to_client,
                    &ns,
                    &to_ns,
                    &trans,
                    &config,
                ) {
                    Ok(indexes) => CollectionStatus::Done(ns, indexes),
                    Err(err) => CollectionStatus::Failed(SyncError::NamespaceSyncError {
                        ns: ns.str(),
                        source: Box::new(err),
                    }),
                };
                let _ = status_tx.send(status);
            });
        }
        drop(status_tx);

        let mut index_map = HashMap::new();
        let mut first_error = None;
        let mut done = 0usize;
        for status in status_rx.iter() {
            match status {
                CollectionStatus::Done(ns, indexes) => {
                    done += 1;
                    info!(
                        syncer = self.id,
                        ns = %ns,
                        progress = done * 100 / total,
                        "collection sync successful"
                    );
                    index_map.insert(ns, indexes);
                }
                CollectionStatus::Failed(err) => {
                    error!(syncer = self.id, %err, "collection sync failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            None => Ok(index_map),
            Some(err) => Err(err),
        }
    }
}

/// Copy one namespace: stream documents, buffer them by count and byte
/// size, hand batches to the collection executor, then report the indexes.
fn collection_sync(
    executor_id: i32,
    from_client: &Client,
    to_client: &Client,
    ns: &Ns,
    to_ns: &Ns,
    trans: &NamespaceTransform,
    config: &ReplicatorConfig,
) -> Result<Vec<Document>> {
    let mut reader = DocumentReader::new(from_client.clone(), ns.clone());
    let mut executor = CollectionExecutor::new(executor_id, to_client.clone(), to_ns.clone());
    executor.start(config.replayer_document_parallel);

    let batch_size = config.replayer_document_batch_size;
    let rewrite_refs = config.dbref && !trans.is_empty();
    let mut buffer: Vec<RawDocumentBuf> = Vec::with_capacity(batch_size);
    let mut buffer_bytes = 0usize;

    loop {
        match reader.next_doc()? {
            None => {
                executor.sync(std::mem::take(&mut buffer))?;
                break;
            }
            Some(raw) => {
                let raw = if rewrite_refs {
                    rewrite_document_refs(raw, &ns.database, trans)?
                } else {
                    raw
                };
                if buffer_bytes + raw.as_bytes().len() > MAX_BUFFER_BYTE_SIZE
                    || buffer.len() >= batch_size
                {
                    executor.sync(std::mem::replace(
                        &mut buffer,
                        Vec::with_capacity(batch_size),
                    ))?;
                    buffer_bytes = 0;
                }
                buffer_bytes += raw.as_bytes().len();
                buffer.push(raw);
            }
        }
    }
    executor.wait()?;

    reader.get_indexes()
}

fn rewrite_document_refs(
    raw: RawDocumentBuf,
    db: &str,
    trans: &NamespaceTransform,
) -> Result<RawDocumentBuf> {
    let doc: Document = bson::from_slice(raw.as_bytes())?;
    let doc = transform_dbref(doc, db, trans);
    Ok(RawDocumentBuf::from_bytes(bson::to_vec(&doc)?)?)
}

/// Namespaces of one source worth copying: everything outside the system
/// databases and `system.*` collections that the namespace filter admits.
pub fn get_db_namespaces(client: &Client, ns_filter: &NamespaceFilter) -> Result<Vec<Ns>> {
    let mut out = Vec::new();
    for db_name in client.list_database_names(None, None)? {
        if matches!(db_name.as_str(), "admin" | "local" | "config") {
            continue;
        }
        let db = client.database(&db_name);
        for coll_name in db.list_collection_names(None)? {
            if coll_name.starts_with("system.") {
                continue;
            }
            let ns = Ns::new(db_name.clone(), coll_name);
            if ns_filter.filter_ns(&ns.str()) {
                continue;
            }
            out.push(ns);
        }
    }
    Ok(out)
}
