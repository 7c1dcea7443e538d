//! Oplog entry model.
//!
//! Field reference:
//! <https://github.com/mongodb/mongo/blob/master/src/mongo/db/repl/oplog_entry.idl>
//!
//! ts: The time when the oplog entry was created. (Timestamp)
//! op: The operation type: "i" insert, "u" update, "d" delete, "c" command,
//!     "n" noop.
//! ns: The namespace on which to apply the operation. (String)
//! o:  The operation applied. (Document)
//! o2: Additional information, for updates the filter document. (Document)
//! g:  Optional origin tag (gid) used for replication loop prevention.

use bson::{doc, Document, RawDocumentBuf, Timestamp};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Insert,
    Update,
    Delete,
    Command,
    Noop,
    /// anything the replicator does not know how to replay.
    Other,
}

impl OpType {
    pub fn from_code(code: &str) -> OpType {
        match code {
            "i" => OpType::Insert,
            "u" => OpType::Update,
            "d" => OpType::Delete,
            "c" => OpType::Command,
            "n" => OpType::Noop,
            _ => OpType::Other,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            OpType::Insert => "i",
            OpType::Update => "u",
            OpType::Delete => "d",
            OpType::Command => "c",
            OpType::Noop => "n",
            OpType::Other => "x",
        }
    }

    pub fn is_command(self) -> bool {
        self == OpType::Command
    }

    pub fn is_noop(self) -> bool {
        self == OpType::Noop
    }
}

impl Serialize for OpType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for OpType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<OpType, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(OpType::from_code(&code))
    }
}

/// Parsed view of one oplog entry. Unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: Timestamp,
    pub op: OpType,
    pub ns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g: Option<String>,
    #[serde(default)]
    pub o: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o2: Option<Document>,
}

impl OplogEntry {
    /// The primary key of the touched document: updates carry it in the
    /// filter document `o2`, inserts and deletes inside `o`. Commands have
    /// none.
    pub fn primary_key(&self) -> Option<&bson::Bson> {
        match self.op {
            OpType::Update => self.o2.as_ref().and_then(|d| d.get("_id")),
            OpType::Command => None,
            _ => self.o.get("_id"),
        }
    }
}

/// One entry carried through the pipeline: the raw bytes a worker forwards
/// without re-serializing, paired with the parsed view the batcher inspects.
#[derive(Debug, Clone)]
pub struct GenericOplog {
    pub raw: RawDocumentBuf,
    pub parsed: OplogEntry,
}

impl GenericOplog {
    pub fn parse(raw: RawDocumentBuf) -> crate::Result<GenericOplog> {
        let parsed: OplogEntry = bson::from_slice(raw.as_bytes())?;
        Ok(GenericOplog { raw, parsed })
    }
}

/// Worker fan-out strategy. Both variants hash with crc32 so an entry lands
/// on the same worker across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OplogHasher {
    /// Hash of the `database.collection` string.
    Table,
    /// Hash of the document primary key.
    PrimaryKey,
}

impl OplogHasher {
    /// Distribution value of `log`. `None` for entries without a hashable
    /// key (commands), which the batcher routes to every worker.
    pub fn distribute(&self, log: &OplogEntry) -> Option<u32> {
        match self {
            OplogHasher::Table => Some(crc32(log.ns.as_bytes())),
            OplogHasher::PrimaryKey => {
                let id = log.primary_key()?;
                let bytes = bson::to_vec(&doc! { "_id": id.clone() }).ok()?;
                Some(crc32(&bytes))
            }
        }
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}
