//! The downstream transport workers hand batches to.
//!
//! Only the [Tunnel] contract is consumed by the incremental core. The
//! bundled [DirectTunnel] replays batches straight into a destination
//! MongoDB: CRUD entries become idempotent `update`/`delete` commands
//! (an insert is replayed as an upsert so re-delivery is harmless), DDL
//! entries are parsed into structured commands and applied one by one.

use crate::error::{cmd_result_is_ok, Result, SyncError};
use crate::namespace::{Ns, NamespaceTransform};
use crate::oplog::{GenericOplog, OplogEntry, OpType};
use bson::{doc, Document};
use mongodb::sync::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub trait Tunnel: Send + Sync {
    /// Hand one batch over. Returning `Ok` means the batch is accepted and
    /// the worker may advance its ack LSN past it.
    fn send(&self, batch: &[GenericOplog]) -> Result<()>;
}

pub struct DirectTunnel {
    conn: Client,
    trans: Arc<NamespaceTransform>,
}

impl DirectTunnel {
    pub fn new(url: &str, trans: Arc<NamespaceTransform>) -> Result<DirectTunnel> {
        Ok(DirectTunnel {
            conn: Client::with_uri_str(url)?,
            trans,
        })
    }

    fn apply_command(&self, log: &OplogEntry) -> Result<()> {
        let db = match log.ns.split_once('.') {
            Some((db, _)) => db,
            None => {
                warn!(ns = %log.ns, "command oplog with unsplittable namespace, ignored");
                return Ok(());
            }
        };
        match DdlCommand::parse(db, &log.o) {
            Some(cmd) => {
                info!(?cmd, "apply command oplog");
                cmd.apply(&self.conn, &self.trans)
            }
            None => Ok(()),
        }
    }

    fn replay_crud(&self, logs: &[&OplogEntry]) -> Result<()> {
        let mut current: Option<OpClass> = None;
        let mut statements: Vec<(Ns, Document)> = Vec::new();
        for log in logs {
            let class = match op_class(log.op) {
                Some(c) => c,
                None => {
                    warn!(op = ?log.op, ns = %log.ns, "unknown oplog operation, ignored");
                    continue;
                }
            };
            if let Some(open) = current {
                if open != class {
                    self.flush_statements(open, &mut statements)?;
                    current = None;
                }
            }
            if let Some(stmt) = build_statement(log) {
                let ns = self
                    .trans
                    .transform_ns(&Ns::parse(&log.ns).unwrap_or_else(|| Ns::new(log.ns.clone(), "?")));
                statements.push((ns, stmt));
                current = Some(class);
            }
        }
        if let Some(class) = current {
            self.flush_statements(class, &mut statements)?;
        }
        Ok(())
    }

    fn flush_statements(&self, class: OpClass, statements: &mut Vec<(Ns, Document)>) -> Result<()> {
        if statements.is_empty() {
            return Ok(());
        }
        let (command, payload_key) = match class {
            OpClass::Upsert => ("update", "updates"),
            OpClass::Delete => ("delete", "deletes"),
        };
        let mut per_coll: HashMap<Ns, Vec<Document>> = HashMap::new();
        for (ns, stmt) in statements.drain(..) {
            per_coll.entry(ns).or_default().push(stmt);
        }
        for (ns, stmts) in per_coll {
            let result = self.conn.database(&ns.database).run_command(
                doc! {
                    command: &ns.collection,
                    payload_key: stmts,
                },
                None,
            )?;
            if result.contains_key("writeErrors") {
                return Err(SyncError::ApplyOplogError(result));
            }
        }
        Ok(())
    }
}

impl Tunnel for DirectTunnel {
    fn send(&self, batch: &[GenericOplog]) -> Result<()> {
        let mut crud: Vec<&OplogEntry> = Vec::new();
        for log in batch {
            if log.parsed.op.is_command() {
                self.replay_crud(&crud)?;
                crud.clear();
                self.apply_command(&log.parsed)?;
            } else {
                crud.push(&log.parsed);
            }
        }
        self.replay_crud(&crud)
    }
}

/// Statement class of the server-side bulk commands: inserts and updates
/// share the `update` command, deletes need their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpClass {
    Upsert,
    Delete,
}

fn op_class(op: OpType) -> Option<OpClass> {
    match op {
        OpType::Insert | OpType::Update => Some(OpClass::Upsert),
        OpType::Delete => Some(OpClass::Delete),
        _ => None,
    }
}

/// Build the bulk-command statement for one CRUD entry.
///
/// mongodb behavior:
/// if update, the source generated a 'u' oplog.
/// if update with successful upsert, a 'i' oplog.
/// if insert, a 'i' oplog.
/// if delete, a 'd' oplog.
fn build_statement(log: &OplogEntry) -> Option<Document> {
    match log.op {
        OpType::Update => {
            let id = match log.o2.as_ref().and_then(|d| d.get("_id")) {
                Some(id) => id.clone(),
                None => {
                    warn!(ns = %log.ns, "update oplog without filter _id, ignored");
                    return None;
                }
            };
            let mut obj = log.o.clone();
            let is_update = obj.keys().any(|k| k.starts_with('$'));
            if is_update {
                // $v is for mongodb internal usage, don't send it to the server.
                obj.remove("$v");
                if obj.contains_key("diff") {
                    // the v2 delta format can't be replayed as an update doc.
                    warn!(ns = %log.ns, "delta-format update oplog is unsupported, ignored");
                    return None;
                }
            }
            Some(doc! { "q": { "_id": id }, "u": obj, "upsert": !is_update })
        }
        // replay the insert as an upsert so the oplog applies idempotently.
        OpType::Insert => {
            let id = log.o.get("_id")?.clone();
            Some(doc! { "q": { "_id": id }, "u": log.o.clone(), "upsert": true })
        }
        OpType::Delete => {
            let id = log.o.get("_id")?.clone();
            Some(doc! { "q": { "_id": id }, "limit": 1 })
        }
        _ => None,
    }
}

/// Structured command-type oplog.
#[derive(Debug, PartialEq)]
pub enum DdlCommand<'a> {
    RenameCollection { from: &'a str, to: &'a str },
    DropCollection { db: &'a str, coll: &'a str },
    CreateCollection { db: &'a str, coll: &'a str },
    DropIndexes { db: &'a str, coll: &'a str, name: &'a str },
    CreateIndexes {
        db: &'a str,
        coll: &'a str,
        key: &'a Document,
        name: &'a str,
        unique: bool,
        partial_filter_expression: Option<&'a Document>,
    },
}

impl<'a> DdlCommand<'a> {
    /// Parse the `o` document of a command oplog produced against database
    /// `db`. Unrecognized commands yield `None`.
    pub fn parse(db: &'a str, obj: &'a Document) -> Option<DdlCommand<'a>> {
        if let Ok(rename_ns) = obj.get_str("renameCollection") {
            // obj structure: {"renameCollection": "db.from", "to": "db.to"}
            let to_ns = obj.get_str("to").ok()?;
            if rename_ns.split_once('.').is_none() || to_ns.split_once('.').is_none() {
                warn!(?obj, "renameCollection with invalid namespaces, ignored");
                return None;
            }
            Some(DdlCommand::RenameCollection {
                from: rename_ns,
                to: to_ns,
            })
        } else if let Ok(coll) = obj.get_str("drop") {
            Some(DdlCommand::DropCollection { db, coll })
        } else if let Ok(coll) = obj.get_str("create") {
            Some(DdlCommand::CreateCollection { db, coll })
        } else if let Ok(coll) = obj.get_str("createIndexes") {
            // obj structure: { "createIndexes": "coll", "key": {"x": 1},
            // "name": "x_1", "unique"?: bool, "partialFilterExpression"?: {..} }
            let key = match obj.get_document("key") {
                Ok(d) => d,
                Err(err) => {
                    warn!(?obj, ?err, "createIndexes oplog without key field, ignored");
                    return None;
                }
            };
            let name = match obj.get_str("name") {
                Ok(n) => n,
                Err(err) => {
                    warn!(?obj, ?err, "createIndexes oplog without name field, ignored");
                    return None;
                }
            };
            Some(DdlCommand::CreateIndexes {
                db,
                coll,
                key,
                name,
                unique: obj.get_bool("unique").unwrap_or(false),
                partial_filter_expression: obj.get_document("partialFilterExpression").ok(),
            })
        } else if let Ok(coll) = obj.get_str("dropIndexes") {
            let name = match obj.get_str("index") {
                Ok(n) => n,
                Err(err) => {
                    warn!(?obj, ?err, "dropIndexes oplog without index field, ignored");
                    return None;
                }
            };
            Some(DdlCommand::DropIndexes { db, coll, name })
        } else {
            warn!(?obj, "command oplog can't be handled, ignored");
            None
        }
    }

    /// Apply against `conn`, rewriting every namespace through `trans`.
    pub fn apply(&self, conn: &Client, trans: &NamespaceTransform) -> Result<()> {
        match self {
            DdlCommand::DropCollection { db, coll } => {
                let ns = transformed(trans, db, coll);
                let result = conn
                    .database(&ns.database)
                    .collection::<Document>(&ns.collection)
                    .drop(None);
                if cmd_result_is_ok(&result, "ns not found") {
                    Ok(())
                } else {
                    result.map_err(SyncError::from)
                }
            }
            DdlCommand::CreateCollection { db, coll } => {
                let ns = transformed(trans, db, coll);
                let result = conn
                    .database(&ns.database)
                    .create_collection(&ns.collection, None);
                if cmd_result_is_ok(&result, "already exist") {
                    Ok(())
                } else {
                    result.map_err(SyncError::from)
                }
            }
            DdlCommand::RenameCollection { from, to } => {
                // rename can only run through the admin database.
                let result = conn
                    .database(crate::ADMIN_DB_NAME)
                    .run_command(
                        doc! {
                            "renameCollection": trans.transform(from),
                            "to": trans.transform(to),
                        },
                        None,
                    )
                    .map(|_| ());
                if cmd_result_is_ok(&result, "not exist") {
                    Ok(())
                } else {
                    result.map_err(SyncError::from)
                }
            }
            DdlCommand::DropIndexes { db, coll, name } => {
                let ns = transformed(trans, db, coll);
                let result = conn
                    .database(&ns.database)
                    .run_command(
                        doc! { "dropIndexes": &ns.collection, "index": *name },
                        None,
                    )
                    .map(|_| ());
                if cmd_result_is_ok(&result, "index not found") {
                    Ok(())
                } else {
                    result.map_err(SyncError::from)
                }
            }
            DdlCommand::CreateIndexes {
                db,
                coll,
                key,
                name,
                unique,
                partial_filter_expression,
            } => {
                let ns = transformed(trans, db, coll);
                let mut index_info = doc! { "key": (*key).clone(), "unique": *unique, "name": *name };
                if let Some(expr) = partial_filter_expression {
                    index_info.insert("partialFilterExpression", (*expr).clone());
                }
                conn.database(&ns.database).run_command(
                    doc! {
                        "createIndexes": &ns.collection,
                        "indexes": [index_info],
                    },
                    None,
                )?;
                Ok(())
            }
        }
    }
}

fn transformed(trans: &NamespaceTransform, db: &str, coll: &str) -> Ns {
    trans.transform_ns(&Ns::new(db, coll))
}
