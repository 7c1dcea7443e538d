#![allow(missing_docs)]

use bson::document::ValueAccessError;
use bson::{Document, Timestamp};
use crossbeam::channel::RecvError;
use mongodb::error::{Error as MongoError, ErrorKind};
use std::result::Result as StdResult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Mongodb connection error")]
    MongoError {
        #[from]
        source: MongoError,
    },
    #[error("Check permission for database {db:?} failed, connection string: {uri:?}, detailed: {detail:?}")]
    PermissionError {
        uri: String,
        db: String,
        detail: MongoError,
    },
    #[error("Mongodb document value error")]
    BsonError {
        #[from]
        source: ValueAccessError,
    },
    #[error("Bson deserialize error")]
    BsonDeError {
        #[from]
        source: bson::de::Error,
    },
    #[error("Bson serialize error")]
    BsonSerError {
        #[from]
        source: bson::ser::Error,
    },
    #[error("Raw bson error")]
    RawBsonError {
        #[from]
        source: bson::raw::Error,
    },
    #[error("Receiver task message error")]
    ReceiveStatusError {
        #[from]
        source: RecvError,
    },
    #[error("Invalid configuration: {reason}")]
    ConfigError { reason: String },
    #[error("Oplog collection of {replset:?} is capped past the resume point, manual intervention required")]
    CollectionCapped { replset: String },
    #[error("Pipeline channel closed unexpectedly")]
    ChannelClosed,
    #[error("Can't fetch doc from mongodb")]
    EmptyDocError,
    #[error("apply oplogs error")]
    ApplyOplogError(Document),
    #[error("sync ns {ns:?} failed")]
    NamespaceSyncError {
        ns: String,
        #[source]
        source: Box<SyncError>,
    },
    #[error("oldest oplog entry {oldest:?} of {replset:?} already passed full sync begin {begin:?}, enlarge the oplog or restart full sync")]
    HandoffMissing {
        replset: String,
        oldest: Timestamp,
        begin: Timestamp,
    },
}

pub type Result<T> = StdResult<T, SyncError>;

/// Whether `result` is ok, treating a server command error whose message
/// contains `valid_err_msg` as success.
pub fn cmd_result_is_ok<T>(result: &StdResult<T, MongoError>, valid_err_msg: &str) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => cmd_err_msg_contains(e, valid_err_msg),
    }
}

fn cmd_err_msg_contains(error: &MongoError, msg: &str) -> bool {
    match error.kind.as_ref() {
        ErrorKind::Command(err) => err.message.to_lowercase().contains(msg),
        _ => false,
    }
}
