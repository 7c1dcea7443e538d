//! Streaming reader over one source namespace: every document as raw bson,
//! then the namespace's indexes.

use crate::error::{Result, SyncError};
use crate::namespace::Ns;
use bson::{doc, Document, RawDocumentBuf};
use mongodb::options::FindOptions;
use mongodb::sync::{Client, Collection, Cursor};

const CURSOR_BATCH_SIZE: u32 = 8192;

pub struct DocumentReader {
    client: Client,
    ns: Ns,
    cursor: Option<Cursor<RawDocumentBuf>>,
}

impl DocumentReader {
    pub fn new(client: Client, ns: Ns) -> DocumentReader {
        DocumentReader {
            client,
            ns,
            cursor: None,
        }
    }

    /// Next document, `None` at end of stream.
    pub fn next_doc(&mut self) -> Result<Option<RawDocumentBuf>> {
        if self.cursor.is_none() {
            let coll: Collection<RawDocumentBuf> = self
                .client
                .database(&self.ns.database)
                .collection(&self.ns.collection);
            let cursor = coll.find(
                None,
                FindOptions::builder().batch_size(CURSOR_BATCH_SIZE).build(),
            )?;
            self.cursor = Some(cursor);
        }
        match self.cursor.as_mut().and_then(|c| c.next()) {
            Some(Ok(doc)) => Ok(Some(doc)),
            Some(Err(err)) => Err(SyncError::from(err)),
            None => Ok(None),
        }
    }

    /// Index specs of the namespace. Reads the first batch of the
    /// listIndexes cursor; namespaces with more indexes than one server
    /// batch are out of shape for a replicator anyway.
    pub fn get_indexes(&self) -> Result<Vec<Document>> {
        let result = self
            .client
            .database(&self.ns.database)
            .run_command(doc! { "listIndexes": &self.ns.collection }, None)?;
        let batch = result
            .get_document("cursor")?
            .get_array("firstBatch")?
            .iter()
            .filter_map(|b| b.as_document().cloned())
            .collect();
        Ok(batch)
    }
}
