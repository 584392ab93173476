//! Document store abstraction
//!
//! The session service talks to its backing store through the
//! [`DocumentStore`] capability trait: point reads and writes on
//! hierarchically addressed documents, ordered and filtered collection
//! queries, and atomic multi-write batches. Two backends ship here - an
//! in-memory store and a sled-backed persistent store - and the merge,
//! lifecycle, and append logic is testable against either.

pub mod memory;
pub mod sled;

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use serde::ser::Error as _;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

pub use self::memory::MemoryStore;
pub use self::sled::SledStore;

/// A stored document: a JSON object, possibly with nested maps.
pub type Document = Map<String, Value>;

/// Path to a single document.
///
/// The hierarchy is fixed: `applications/{app_id}` holds application
/// state, `applications/{app_id}/users/{user_id}` user state, with
/// `sessions/{session_id}` and `events/{event_id}` nested below.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath(String);

impl DocPath {
    pub fn application(app_name: &str) -> Self {
        Self(format!("applications/{app_name}"))
    }

    pub fn user(app_name: &str, user_id: &str) -> Self {
        Self(format!("applications/{app_name}/users/{user_id}"))
    }

    pub fn session(app_name: &str, user_id: &str, session_id: &str) -> Self {
        Self(format!(
            "applications/{app_name}/users/{user_id}/sessions/{session_id}"
        ))
    }

    pub fn event(app_name: &str, user_id: &str, session_id: &str, event_id: &str) -> Self {
        Self(format!(
            "applications/{app_name}/users/{user_id}/sessions/{session_id}/events/{event_id}"
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path to a collection of sibling documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn sessions(app_name: &str, user_id: &str) -> Self {
        Self(format!("applications/{app_name}/users/{user_id}/sessions"))
    }

    pub fn events(app_name: &str, user_id: &str, session_id: &str) -> Self {
        Self(format!(
            "applications/{app_name}/users/{user_id}/sessions/{session_id}/events"
        ))
    }

    /// Path of the document with `id` in this collection.
    pub fn doc(&self, id: &str) -> DocPath {
        DocPath(format!("{}/{id}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Sort direction for [`Query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// A collection query: order by one field, optionally filter by a strict
/// lower bound on one field, optionally limit the result count.
#[derive(Debug, Clone)]
pub struct Query {
    pub order_by: String,
    pub direction: Direction,
    pub greater_than: Option<(String, Value)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn ascending(field: &str) -> Self {
        Self {
            order_by: field.to_string(),
            direction: Direction::Ascending,
            greater_than: None,
            limit: None,
        }
    }

    pub fn descending(field: &str) -> Self {
        Self {
            order_by: field.to_string(),
            direction: Direction::Descending,
            greater_than: None,
            limit: None,
        }
    }

    /// Keep only documents whose `field` is strictly greater than `bound`.
    pub fn greater_than(mut self, field: &str, bound: Value) -> Self {
        self.greater_than = Some((field.to_string(), bound));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One write in a batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Replace the whole document.
    Set { path: DocPath, doc: Document },
    /// Upsert the given top-level fields, leaving others untouched.
    /// Creates the document if absent.
    Merge { path: DocPath, fields: Document },
    /// Write the given fields, interpreting `.` in a field name as
    /// nesting. Fails if the document does not exist.
    Update { path: DocPath, fields: Document },
    /// Remove the document; a no-op if absent.
    Delete { path: DocPath },
}

impl WriteOp {
    pub fn path(&self) -> &DocPath {
        match self {
            WriteOp::Set { path, .. }
            | WriteOp::Merge { path, .. }
            | WriteOp::Update { path, .. }
            | WriteOp::Delete { path } => path,
        }
    }
}

/// An ordered set of heterogeneous writes committed as one unit.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: DocPath, doc: Document) -> &mut Self {
        self.ops.push(WriteOp::Set { path, doc });
        self
    }

    pub fn merge(&mut self, path: DocPath, fields: Document) -> &mut Self {
        self.ops.push(WriteOp::Merge { path, fields });
        self
    }

    pub fn update(&mut self, path: DocPath, fields: Document) -> &mut Self {
        self.ops.push(WriteOp::Update { path, fields });
        self
    }

    pub fn delete(&mut self, path: DocPath) -> &mut Self {
        self.ops.push(WriteOp::Delete { path });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Capability interface over a hierarchical document store.
///
/// Point reads are strongly consistent with prior writes to the same
/// document; a committed batch is all-or-nothing. Nothing here cascades:
/// deleting a document leaves documents nested under its path in place.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read. Absence is `Ok(None)`, not an error.
    async fn get(&self, path: &DocPath) -> Result<Option<Document>>;

    /// Full-document write, creating or replacing.
    async fn set(&self, path: &DocPath, doc: Document) -> Result<()>;

    /// Upsert the given top-level fields without clobbering the rest.
    /// Creates the document if absent.
    async fn merge(&self, path: &DocPath, fields: Document) -> Result<()>;

    /// Field-level write, `.`-separated names addressing nested maps.
    /// Fails with [`StoreError::DocumentNotFound`] if the document does
    /// not exist.
    async fn update(&self, path: &DocPath, fields: Document) -> Result<()>;

    /// Remove a document. Idempotent.
    async fn delete(&self, path: &DocPath) -> Result<()>;

    /// Immediate children of `collection`, filtered, ordered, and limited
    /// per `query`. Each result carries its document id (the final path
    /// segment).
    async fn query(
        &self,
        collection: &CollectionPath,
        query: Query,
    ) -> Result<Vec<(String, Document)>>;

    /// Apply a batch of writes as a single all-or-nothing unit.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}

/// Serialize any value into a [`Document`], rejecting non-objects.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(doc) => Ok(doc),
        _ => Err(StoreError::Serialization(serde_json::Error::custom(
            "value did not serialize to a JSON object",
        ))),
    }
}

/// Total order over field values for query ordering: null < bool <
/// number < string; aggregates compare equal among themselves.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Filter, order, and truncate collection children per `query`.
pub(crate) fn run_query(
    mut docs: Vec<(String, Document)>,
    query: &Query,
) -> Vec<(String, Document)> {
    if let Some((field, bound)) = &query.greater_than {
        docs.retain(|(_, doc)| {
            doc.get(field)
                .is_some_and(|value| compare_values(value, bound) == Ordering::Greater)
        });
    }
    docs.sort_by(|(_, a), (_, b)| {
        let av = a.get(&query.order_by).unwrap_or(&Value::Null);
        let bv = b.get(&query.order_by).unwrap_or(&Value::Null);
        match query.direction {
            Direction::Ascending => compare_values(av, bv),
            Direction::Descending => compare_values(av, bv).reverse(),
        }
    });
    if let Some(limit) = query.limit {
        docs.truncate(limit);
    }
    docs
}

/// Upsert `fields` into `doc` at the top level.
pub(crate) fn merge_fields(doc: &mut Document, fields: Document) {
    for (key, value) in fields {
        doc.insert(key, value);
    }
}

/// Write one field, interpreting `.` as nesting: `state.step` writes
/// `doc["state"]["step"]`, replacing any non-object on the way down.
pub(crate) fn apply_field(doc: &mut Document, field: &str, value: Value) {
    match field.split_once('.') {
        None => {
            doc.insert(field.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(nested) = entry {
                apply_field(nested, rest, value);
            }
        }
    }
}

/// Key of a direct child of `collection` in the flat keyspace, if `key`
/// names one. Returns the child's document id.
pub(crate) fn child_id<'a>(collection: &CollectionPath, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(collection.as_str())?.strip_prefix('/')?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}
