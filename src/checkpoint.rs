//! Durable checkpoint store: one record per replica set holding the last
//! committed oplog timestamp. Updates are idempotent and monotone, and a
//! write has been journaled on the destination before `update` returns.

use crate::error::Result;
use crate::timestamp;
use bson::{doc, Document, Timestamp};
use mongodb::options::{CollectionOptions, UpdateOptions, WriteConcern};
use mongodb::sync::{Client, Collection};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const NAME_KEY: &str = "name";

/// Outcome of the monotone advance decision. Pure so the invariant is
/// testable without a store.
pub fn advance(current: Option<Timestamp>, candidate: Timestamp) -> Option<Timestamp> {
    match current {
        Some(cur) if candidate <= cur => None,
        _ if candidate == timestamp::ZERO => None,
        _ => Some(candidate),
    }
}

pub struct CheckpointManager {
    replset: String,
    start_position: Timestamp,
    coll: Collection<Document>,
    interval: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    current: Option<Timestamp>,
    last_flush: Option<Instant>,
}

impl CheckpointManager {
    pub fn new(
        storage: &Client,
        db: &str,
        coll: &str,
        replset: impl Into<String>,
        start_position: Timestamp,
        interval: Duration,
    ) -> CheckpointManager {
        // the checkpoint invariant only holds if the record survives a
        // server crash, so writes go out journaled.
        let options = CollectionOptions::builder()
            .write_concern(WriteConcern::builder().journal(true).build())
            .build();
        CheckpointManager {
            replset: replset.into(),
            start_position,
            coll: storage.database(db).collection_with_options(coll, options),
            interval,
            inner: Mutex::new(Inner {
                current: None,
                last_flush: None,
            }),
        }
    }

    pub fn replset(&self) -> &str {
        &self.replset
    }

    /// Read the stored record. A missing record is not an error: the
    /// configured start position is returned with `exists == false` and the
    /// first `update` creates the record.
    pub fn load(&self) -> Result<(Timestamp, bool)> {
        let rec = self
            .coll
            .find_one(doc! { NAME_KEY: &self.replset }, None)?;
        let mut inner = self.inner.lock().expect("checkpoint lock");
        match rec {
            Some(d) => {
                let ts = d.get_timestamp(crate::TIMESTAMP_KEY)?;
                inner.current = Some(ts);
                Ok((ts, true))
            }
            None => {
                inner.current = Some(self.start_position);
                Ok((self.start_position, false))
            }
        }
    }

    /// Last loaded or committed timestamp; loads from the store when no
    /// value is cached yet.
    pub fn get(&self) -> Result<Timestamp> {
        {
            let inner = self.inner.lock().expect("checkpoint lock");
            if let Some(ts) = inner.current {
                return Ok(ts);
            }
        }
        self.load().map(|(ts, _)| ts)
    }

    /// Advance the checkpoint to `ts`. A candidate at or below the current
    /// value is a successful no-op. Non-forced updates honor the flush
    /// cadence; forced updates (barriers, handoff) always hit the store.
    pub fn update(&self, ts: Timestamp, force: bool) -> Result<()> {
        let mut inner = self.inner.lock().expect("checkpoint lock");
        let target = match advance(inner.current, ts) {
            Some(t) => t,
            None => return Ok(()),
        };
        if !force {
            if let Some(at) = inner.last_flush {
                if at.elapsed() < self.interval {
                    return Ok(());
                }
            }
        }
        self.coll.update_one(
            doc! { NAME_KEY: &self.replset },
            doc! { "$set": { crate::TIMESTAMP_KEY: target } },
            UpdateOptions::builder().upsert(true).build(),
        )?;
        debug!(replset = %self.replset, ckpt = ?target, "checkpoint flushed");
        inner.current = Some(target);
        inner.last_flush = Some(Instant::now());
        Ok(())
    }

    /// Forced flush used by the full-sync handoff.
    pub fn install(&self, ts: Timestamp) -> Result<()> {
        info!(replset = %self.replset, ckpt = ?ts, "install handoff checkpoint");
        self.update(ts, true)
    }
}
