//! Tailing reader over one source oplog.
//!
//! A background fetcher owns the tailable cursor and feeds raw entries into
//! a bounded channel; `next` pops with a short timeout so callers yield
//! periodically on silent feeds. Transient cursor failures are handled
//! inside the fetcher (close, yield, reopen); only a capped oplog, where
//! the source has truncated past the resume point, is surfaced as terminal.

use crate::error::{Result, SyncError};
use crate::timestamp;
use crate::{OPLOG_COLL, OPLOG_DB, TIMESTAMP_KEY};
use bson::{doc, Document, RawDocumentBuf, Timestamp};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use mongodb::options::{CursorType, FindOneOptions, FindOptions};
use mongodb::sync::{Client, Collection};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Capacity of the fetcher → syncer hand-off channel.
const OPLOG_CHANNEL_SIZE: usize = 256;
/// How long `next` waits before reporting "no data now".
const NEXT_WAIT_MS: u64 = 1000;
/// Yield between cursor reopen attempts inside the fetcher.
const FETCHER_RETRY_MS: u64 = 1000;

enum FetchMessage {
    Entry(RawDocumentBuf),
    Failed(SyncError),
}

pub struct OplogReader {
    replset: String,
    client: Client,
    query_ts: Arc<AtomicI64>,
    fetcher_started: AtomicBool,
    shutdown: Arc<AtomicBool>,
    tx: Sender<FetchMessage>,
    rx: Receiver<FetchMessage>,
}

impl OplogReader {
    pub fn new(url: &str, replset: impl Into<String>, shutdown: Arc<AtomicBool>) -> Result<OplogReader> {
        let (tx, rx) = bounded(OPLOG_CHANNEL_SIZE);
        Ok(OplogReader {
            replset: replset.into(),
            client: Client::with_uri_str(url)?,
            query_ts: Arc::new(AtomicI64::new(0)),
            fetcher_started: AtomicBool::new(false),
            shutdown,
            tx,
            rx,
        })
    }

    /// Seed the resume position, but only when none is established yet;
    /// used when `poll` reloads the checkpoint.
    pub fn set_query_timestamp_on_empty(&self, ts: Timestamp) {
        let _ = self.query_ts.compare_exchange(
            0,
            timestamp::to_i64(ts),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Move the in-memory resume position forward.
    pub fn update_query_timestamp(&self, ts: Timestamp) {
        self.query_ts.fetch_max(timestamp::to_i64(ts), Ordering::SeqCst);
    }

    pub fn query_timestamp(&self) -> Timestamp {
        timestamp::from_i64(self.query_ts.load(Ordering::SeqCst))
    }

    /// Launch the fetcher worker if it is not running yet. Idempotent.
    pub fn start_fetcher(&self) {
        if self.fetcher_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.client.clone();
        let tx = self.tx.clone();
        let query_ts = self.query_ts.clone();
        let shutdown = self.shutdown.clone();
        let replset = self.replset.clone();
        thread::Builder::new()
            .name(format!("oplog-fetcher-{}", self.replset))
            .spawn(move || fetcher_loop(client, tx, query_ts, shutdown, replset))
            .expect("spawn oplog fetcher thread");
    }

    /// The next entry strictly after the current query timestamp. `Ok(None)`
    /// without an error means "no data now".
    pub fn next(&self) -> Result<Option<RawDocumentBuf>> {
        match self.rx.recv_timeout(Duration::from_millis(NEXT_WAIT_MS)) {
            Ok(FetchMessage::Entry(raw)) => Ok(Some(raw)),
            Ok(FetchMessage::Failed(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            // the fetcher is gone; during shutdown that is the quiet path.
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

fn fetcher_loop(
    client: Client,
    tx: Sender<FetchMessage>,
    query_ts: Arc<AtomicI64>,
    shutdown: Arc<AtomicBool>,
    replset: String,
) {
    let raw_coll: Collection<RawDocumentBuf> =
        client.database(OPLOG_DB).collection(OPLOG_COLL);
    let probe_coll: Collection<Document> = client.database(OPLOG_DB).collection(OPLOG_COLL);

    while !shutdown.load(Ordering::SeqCst) {
        let resume = timestamp::from_i64(query_ts.load(Ordering::SeqCst));

        if resume != timestamp::ZERO {
            match earliest_ts(&probe_coll) {
                Ok(oldest) if oldest > resume => {
                    error!(
                        %replset, ?oldest, ?resume,
                        "oplog collection truncated past the resume point"
                    );
                    let _ = tx.send(FetchMessage::Failed(SyncError::CollectionCapped {
                        replset: replset.clone(),
                    }));
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%replset, %err, "probing oplog head failed, retry");
                    let _ = tx.send(FetchMessage::Failed(err));
                    thread::sleep(Duration::from_millis(FETCHER_RETRY_MS));
                    continue;
                }
            }
        }

        let filter = doc! { TIMESTAMP_KEY: { "$gt": resume } };
        let options = FindOptions::builder()
            .cursor_type(CursorType::TailableAwait)
            .max_await_time(Duration::from_secs(2))
            .build();
        match raw_coll.find(filter, options) {
            Ok(cursor) => {
                info!(%replset, ?resume, "oplog cursor opened");
                for item in cursor {
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    match item {
                        Ok(raw) => {
                            // a blocked send is the backpressure path.
                            if tx.send(FetchMessage::Entry(raw)).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(%replset, %err, "oplog cursor broke, reopening");
                            let _ = tx.send(FetchMessage::Failed(err.into()));
                            break;
                        }
                    }
                }
                // a dead tailable cursor is routine: fall through and reopen.
            }
            Err(err) => {
                warn!(%replset, %err, "open oplog cursor failed, retry");
                let _ = tx.send(FetchMessage::Failed(err.into()));
            }
        }
        thread::sleep(Duration::from_millis(FETCHER_RETRY_MS));
    }
}

fn earliest_ts(coll: &Collection<Document>) -> Result<Timestamp> {
    coll.find_one(
        None,
        FindOneOptions::builder().sort(doc! { "$natural": 1 }).build(),
    )?
    .map(|d| d.get_timestamp(TIMESTAMP_KEY).map_err(SyncError::from))
    .unwrap_or_else(|| Err(SyncError::EmptyDocError))
}
