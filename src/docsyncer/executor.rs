//! Destination-side executors of the full sync: one collection executor per
//! namespace owning a pool of document executors that drain a shared batch
//! channel.

use crate::error::{Result, SyncError};
use crate::namespace::Ns;
use bson::RawDocumentBuf;
use crossbeam::channel::{bounded, Receiver, Sender};
use mongodb::sync::{Client, Collection};
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{error, info};

// process-unique executor ids, for log correlation only.
static COLL_EXECUTOR_ID: AtomicI32 = AtomicI32::new(-1);
static DOC_EXECUTOR_ID: AtomicI32 = AtomicI32::new(-1);

pub fn generate_coll_executor_id() -> i32 {
    COLL_EXECUTOR_ID.fetch_add(1, Ordering::SeqCst) + 1
}

fn generate_doc_executor_id() -> i32 {
    DOC_EXECUTOR_ID.fetch_add(1, Ordering::SeqCst) + 1
}

pub struct CollectionExecutor {
    id: i32,
    ns: Ns,
    conn: Client,
    batch_tx: Option<Sender<Vec<RawDocumentBuf>>>,
    executors: Vec<JoinHandle<Result<()>>>,
}

impl CollectionExecutor {
    pub fn new(id: i32, conn: Client, ns: Ns) -> CollectionExecutor {
        CollectionExecutor {
            id,
            ns,
            conn,
            batch_tx: None,
            executors: Vec::new(),
        }
    }

    pub fn start(&mut self, document_parallel: usize) {
        let (tx, rx) = bounded(document_parallel);
        self.batch_tx = Some(tx);
        for _ in 0..document_parallel {
            let executor_id = generate_doc_executor_id();
            let coll: Collection<RawDocumentBuf> = self
                .conn
                .database(&self.ns.database)
                .collection(&self.ns.collection);
            let ns = self.ns.clone();
            let rx: Receiver<Vec<RawDocumentBuf>> = rx.clone();
            self.executors.push(
                thread::Builder::new()
                    .name(format!("doc-executor-{}", executor_id))
                    .spawn(move || doc_executor(executor_id, coll, ns, rx))
                    .expect("spawn doc executor thread"),
            );
        }
    }

    /// Enqueue one batch; empty batches are a no-op.
    pub fn sync(&self, docs: Vec<RawDocumentBuf>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        match &self.batch_tx {
            Some(tx) => tx.send(docs).map_err(|_| SyncError::ChannelClosed),
            None => Err(SyncError::ChannelClosed),
        }
    }

    /// Close the batch channel, drain the executors and report the first
    /// error observed.
    pub fn wait(mut self) -> Result<()> {
        self.batch_tx.take();
        let mut first_error = None;
        for handle in self.executors.drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
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
        match first_error {
            None => Ok(()),
            Some(err) => Err(SyncError::NamespaceSyncError {
                ns: self.ns.str(),
                source: Box::new(err),
            }),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }
}

/// Drains batches until the channel closes. After a failure the executor
/// keeps draining without writing so the producer never blocks on a dead
/// pool.
fn doc_executor(
    id: i32,
    coll: Collection<RawDocumentBuf>,
    ns: Ns,
    rx: Receiver<Vec<RawDocumentBuf>>,
) -> Result<()> {
    let mut failed: Option<SyncError> = None;
    for docs in rx.iter() {
        if failed.is_some() {
            continue;
        }
        if docs.is_empty() {
            continue;
        }
        let count = docs.len();
        if let Err(err) = coll.insert_many(docs, None) {
            error!(executor = id, ns = %ns, count, %err, "insert batch failed");
            failed = Some(SyncError::from(err));
        }
    }
    info!(executor = id, ns = %ns, "doc executor finished");
    match failed {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_executor_ids_are_unique_and_increasing() {
        let a = generate_coll_executor_id();
        let b = generate_coll_executor_id();
        assert!(b > a);
    }
}
