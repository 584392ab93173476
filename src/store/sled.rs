//! Sled-backed document store
//!
//! Documents are JSON-encoded under their path string in a single tree.
//! Batches and read-modify-write operations run inside sled transactions,
//! which gives the all-or-nothing commit the service relies on. Sled's
//! calls are synchronous, so every operation hops to the blocking pool.

use std::path::{Path, PathBuf};

use ::sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use ::sled::{Db, Tree};
use async_trait::async_trait;
use tokio::task;

use crate::error::{Result, StoreError};

use super::{
    apply_field, child_id, merge_fields, run_query, CollectionPath, DocPath, Document,
    DocumentStore, Query, WriteBatch, WriteOp,
};

const DOCUMENTS_TREE: &str = "documents";

/// Persistent document store backed by sled.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    tree: Tree,
}

impl SledStore {
    /// Create or open a store at the default location under the platform
    /// config directory.
    pub fn open_default() -> Result<Self> {
        Self::open(default_db_path("sessions.db")?)
    }

    /// Open a store at a specific path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        // Ensure the parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = ::sled::open(path.as_ref())?;
        let tree = db.open_tree(DOCUMENTS_TREE)?;
        Ok(Self { db, tree })
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        let db = self.db.clone();
        task::spawn_blocking(move || -> Result<()> {
            db.flush()?;
            Ok(())
        })
        .await?
    }

    async fn apply_ops(&self, ops: Vec<WriteOp>) -> Result<()> {
        let tree = self.tree.clone();
        task::spawn_blocking(move || -> Result<()> {
            let result = tree.transaction(|tx| {
                for op in &ops {
                    tx_apply_op(tx, op)?;
                }
                Ok(())
            });
            commit_result(result)?;
            tree.flush()?;
            Ok(())
        })
        .await?
    }
}

/// Default database location under the platform config directory.
pub(crate) fn default_db_path(name: &str) -> Result<PathBuf> {
    let path = dirs::config_dir()
        .ok_or_else(|| StoreError::Config("no config directory found".to_string()))?;
    Ok(path.join("agent-sessions").join(name))
}

fn read_doc(tree: &Tree, key: &str) -> Result<Option<Document>> {
    match tree.get(key.as_bytes())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn abort<E: Into<StoreError>>(err: E) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(err.into())
}

fn tx_read_doc(
    tx: &TransactionalTree,
    key: &str,
) -> ConflictableTransactionResult<Option<Document>, StoreError> {
    match tx.get(key.as_bytes())? {
        Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(abort),
        None => Ok(None),
    }
}

fn tx_write_doc(
    tx: &TransactionalTree,
    key: &str,
    doc: &Document,
) -> ConflictableTransactionResult<(), StoreError> {
    let bytes = serde_json::to_vec(doc).map_err(abort)?;
    tx.insert(key.as_bytes(), bytes)?;
    Ok(())
}

fn tx_apply_op(
    tx: &TransactionalTree,
    op: &WriteOp,
) -> ConflictableTransactionResult<(), StoreError> {
    match op {
        WriteOp::Set { path, doc } => tx_write_doc(tx, path.as_str(), doc),
        WriteOp::Merge { path, fields } => {
            let mut doc = tx_read_doc(tx, path.as_str())?.unwrap_or_default();
            merge_fields(&mut doc, fields.clone());
            tx_write_doc(tx, path.as_str(), &doc)
        }
        WriteOp::Update { path, fields } => {
            let Some(mut doc) = tx_read_doc(tx, path.as_str())? else {
                return Err(abort(StoreError::DocumentNotFound(path.to_string())));
            };
            for (field, value) in fields {
                apply_field(&mut doc, field, value.clone());
            }
            tx_write_doc(tx, path.as_str(), &doc)
        }
        WriteOp::Delete { path } => {
            tx.remove(path.as_str().as_bytes())?;
            Ok(())
        }
    }
}

fn commit_result<T>(result: std::result::Result<T, TransactionError<StoreError>>) -> Result<T> {
    result.map_err(|err| match err {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(e) => StoreError::Backend(e),
    })
}

#[async_trait]
impl DocumentStore for SledStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>> {
        let tree = self.tree.clone();
        let key = path.as_str().to_string();
        task::spawn_blocking(move || read_doc(&tree, &key)).await?
    }

    async fn set(&self, path: &DocPath, doc: Document) -> Result<()> {
        self.apply_ops(vec![WriteOp::Set {
            path: path.clone(),
            doc,
        }])
        .await
    }

    async fn merge(&self, path: &DocPath, fields: Document) -> Result<()> {
        self.apply_ops(vec![WriteOp::Merge {
            path: path.clone(),
            fields,
        }])
        .await
    }

    async fn update(&self, path: &DocPath, fields: Document) -> Result<()> {
        self.apply_ops(vec![WriteOp::Update {
            path: path.clone(),
            fields,
        }])
        .await
    }

    async fn delete(&self, path: &DocPath) -> Result<()> {
        self.apply_ops(vec![WriteOp::Delete { path: path.clone() }])
            .await
    }

    async fn query(
        &self,
        collection: &CollectionPath,
        query: Query,
    ) -> Result<Vec<(String, Document)>> {
        let tree = self.tree.clone();
        let collection = collection.clone();
        task::spawn_blocking(move || -> Result<Vec<(String, Document)>> {
            let prefix = format!("{}/", collection.as_str());
            let mut children = Vec::new();
            for item in tree.scan_prefix(prefix.as_bytes()) {
                let (key, bytes) = item?;
                let Ok(key) = std::str::from_utf8(&key) else {
                    continue;
                };
                let Some(id) = child_id(&collection, key) else {
                    continue;
                };
                let doc: Document = serde_json::from_slice(&bytes)?;
                children.push((id.to_string(), doc));
            }
            Ok(run_query(children, &query))
        })
        .await?
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.apply_ops(batch.ops().to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(pairs: &[(&str, serde_json::Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip_and_reopen() {
        let dir = tempdir().unwrap();
        let path = DocPath::application("a");
        {
            let store = SledStore::open(dir.path().join("db")).unwrap();
            store.set(&path, doc(&[("k", json!("v"))])).await.unwrap();
            assert_eq!(
                store.get(&path).await.unwrap(),
                Some(doc(&[("k", json!("v"))]))
            );
        }
        // Reopen: the document survived.
        let store = SledStore::open(dir.path().join("db")).unwrap();
        assert_eq!(
            store.get(&path).await.unwrap(),
            Some(doc(&[("k", json!("v"))]))
        );
    }

    #[tokio::test]
    async fn test_update_missing_document_fails() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db")).unwrap();
        let err = store
            .update(&DocPath::application("a"), doc(&[("k", json!(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db")).unwrap();

        let mut batch = WriteBatch::new();
        batch.set(DocPath::application("a"), doc(&[("k", json!(1))]));
        batch.update(
            DocPath::session("a", "u", "missing"),
            doc(&[("x", json!(1))]),
        );

        let err = store.commit(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::DocumentNotFound(_)));
        assert!(store
            .get(&DocPath::application("a"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_merge_and_query() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db")).unwrap();
        let events = CollectionPath::events("a", "u", "s");

        for (id, ts) in [("e1", 3), ("e2", 1), ("e3", 2)] {
            store
                .set(&events.doc(id), doc(&[("timestamp", json!(ts))]))
                .await
                .unwrap();
        }
        store
            .merge(&DocPath::application("a"), doc(&[("counter", json!(1))]))
            .await
            .unwrap();

        let results = store
            .query(
                &events,
                Query::ascending("timestamp").greater_than("timestamp", json!(1)),
            )
            .await
            .unwrap();
        let ids: Vec<_> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["e3", "e1"]);

        // The application document is not part of any queried collection here.
        let app = store.get(&DocPath::application("a")).await.unwrap().unwrap();
        assert_eq!(app.get("counter"), Some(&json!(1)));
    }
}
