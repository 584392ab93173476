//! Session records - per-(application, user) conversation state
//!
//! The persisted session document holds identity, session-local state, and
//! the last-update timestamp. The event log lives in a sub-collection and
//! is reattached on read; tier-prefixed keys are overlaid on the state map
//! by the merge engine and exist only in the in-memory view.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::event::Event;
use crate::store::Document;

/// A conversational-agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier, caller-supplied or generated.
    pub id: String,

    /// Owning application identifier.
    pub app_name: String,

    /// Owning user identifier.
    pub user_id: String,

    /// State map. As persisted it holds session-local keys only; the view
    /// returned to callers additionally carries `app:`- and
    /// `user:`-prefixed entries overlaid by the merge engine.
    #[serde(default)]
    pub state: Map<String, Value>,

    /// Event log, ascending by timestamp. Reconstructed from the events
    /// sub-collection; never stored in the session document itself.
    #[serde(skip)]
    pub events: Vec<Event>,

    /// Unix milliseconds of the most recently appended event, or the
    /// creation time if none has been appended.
    #[serde(default)]
    pub last_update_time: i64,
}

impl Session {
    /// The document shape written to the store. Events are excluded; they
    /// go to the sub-collection.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("id".to_string(), Value::String(self.id.clone()));
        doc.insert("app_name".to_string(), Value::String(self.app_name.clone()));
        doc.insert("user_id".to_string(), Value::String(self.user_id.clone()));
        doc.insert("state".to_string(), Value::Object(self.state.clone()));
        doc.insert(
            "last_update_time".to_string(),
            Value::from(self.last_update_time),
        );
        doc
    }

    /// Decode a stored session document.
    ///
    /// A document that fails validation is reconstructed best-effort from
    /// whatever fields are present rather than failing the read: state
    /// defaults to empty, the timestamp to zero, and identifiers fall back
    /// to the request path, which is authoritative for where the document
    /// lives.
    pub(crate) fn from_document(
        doc: Document,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Session {
        match serde_json::from_value::<Session>(Value::Object(doc.clone())) {
            Ok(session) => session,
            Err(err) => {
                warn!(
                    session_id,
                    error = %err,
                    "session record failed validation; reconstructing from raw fields"
                );
                Session {
                    id: field_str(&doc, "id").unwrap_or(session_id).to_string(),
                    app_name: field_str(&doc, "app_name").unwrap_or(app_name).to_string(),
                    user_id: field_str(&doc, "user_id").unwrap_or(user_id).to_string(),
                    state: doc
                        .get("state")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                    events: Vec::new(),
                    last_update_time: doc
                        .get("last_update_time")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                }
            }
        }
    }
}

fn field_str<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    doc.get(key).and_then(Value::as_str)
}

/// Options narrowing the events attached by a session read.
///
/// The two filters are independent; callers typically set at most one.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetSessionOptions {
    /// Only include events strictly newer than this timestamp.
    pub after_timestamp: Option<i64>,

    /// Only include the N most recent events (still returned in ascending
    /// timestamp order).
    pub num_recent_events: Option<usize>,
}
