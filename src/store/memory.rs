//! In-memory document store
//!
//! Backs the test suite and works as an ephemeral backend. Documents live
//! in one ordered map keyed by path string; a batch commit applies to a
//! scratch copy under the write lock and swaps it in only when every write
//! succeeds, so a failed batch leaves the map untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};

use super::{
    child_id, merge_fields, run_query, CollectionPath, DocPath, Document, DocumentStore, Query,
    WriteBatch, WriteOp,
};

/// Hierarchical document store held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Arc<RwLock<BTreeMap<String, Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently stored.
    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

fn apply_op(docs: &mut BTreeMap<String, Document>, op: WriteOp) -> Result<()> {
    match op {
        WriteOp::Set { path, doc } => {
            docs.insert(path.as_str().to_string(), doc);
        }
        WriteOp::Merge { path, fields } => {
            let doc = docs.entry(path.as_str().to_string()).or_default();
            merge_fields(doc, fields);
        }
        WriteOp::Update { path, fields } => {
            let doc = docs
                .get_mut(path.as_str())
                .ok_or_else(|| StoreError::DocumentNotFound(path.to_string()))?;
            for (field, value) in fields {
                super::apply_field(doc, &field, value);
            }
        }
        WriteOp::Delete { path } => {
            docs.remove(path.as_str());
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>> {
        Ok(self.docs.read().await.get(path.as_str()).cloned())
    }

    async fn set(&self, path: &DocPath, doc: Document) -> Result<()> {
        let mut docs = self.docs.write().await;
        apply_op(
            &mut docs,
            WriteOp::Set {
                path: path.clone(),
                doc,
            },
        )
    }

    async fn merge(&self, path: &DocPath, fields: Document) -> Result<()> {
        let mut docs = self.docs.write().await;
        apply_op(
            &mut docs,
            WriteOp::Merge {
                path: path.clone(),
                fields,
            },
        )
    }

    async fn update(&self, path: &DocPath, fields: Document) -> Result<()> {
        let mut docs = self.docs.write().await;
        apply_op(
            &mut docs,
            WriteOp::Update {
                path: path.clone(),
                fields,
            },
        )
    }

    async fn delete(&self, path: &DocPath) -> Result<()> {
        let mut docs = self.docs.write().await;
        apply_op(&mut docs, WriteOp::Delete { path: path.clone() })
    }

    async fn query(
        &self,
        collection: &CollectionPath,
        query: Query,
    ) -> Result<Vec<(String, Document)>> {
        let docs = self.docs.read().await;
        let children: Vec<(String, Document)> = docs
            .range(collection.as_str().to_string()..)
            .take_while(|(key, _)| key.starts_with(collection.as_str()))
            .filter_map(|(key, doc)| {
                child_id(collection, key).map(|id| (id.to_string(), doc.clone()))
            })
            .collect();
        Ok(run_query(children, &query))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut docs = self.docs.write().await;
        // All-or-nothing: apply to a scratch copy, swap in on success.
        let mut scratch = docs.clone();
        for op in batch.ops() {
            apply_op(&mut scratch, op.clone())?;
        }
        *docs = scratch;
        Ok(())
    }
}
