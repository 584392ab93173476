//! Session events - append-only records with state deltas
//!
//! Events carry an opaque content payload plus actions, of which the state
//! delta is the part this crate interprets: key/value changes routed to a
//! state tier by their scope prefix when the event is appended.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Side effects requested by an event.
///
/// Only `state_delta` is interpreted here; the workflow fields ride along
/// opaquely for the calling framework.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventActions {
    /// State updates to apply (key -> value). Keys may carry scope
    /// prefixes: `app:`, `user:`, `temp:`, or none for session scope.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub state_delta: HashMap<String, Value>,

    /// Transfer control to another agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,

    /// Escalate to a human supervisor.
    #[serde(default, skip_serializing_if = "is_false")]
    pub escalate: bool,
}

impl EventActions {
    /// Create actions carrying a single state delta entry.
    pub fn with_state<K: Into<String>, V: Into<Value>>(key: K, value: V) -> Self {
        let mut actions = Self::default();
        actions.state_delta.insert(key.into(), value.into());
        actions
    }

    /// Add a state delta entry.
    pub fn add_state<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.state_delta.insert(key.into(), value.into());
        self
    }

    /// Request transfer to another agent.
    pub fn transfer_to<S: Into<String>>(mut self, agent_name: S) -> Self {
        self.transfer_to_agent = Some(agent_name.into());
        self
    }

    /// Request escalation to a human.
    pub fn escalate(mut self) -> Self {
        self.escalate = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.state_delta.is_empty() && self.transfer_to_agent.is_none() && !self.escalate
    }
}

/// An immutable record in a session's event log.
///
/// Ordered by timestamp within a session; never mutated after creation and
/// deleted only when its session is deleted. Persisted documents omit
/// empty or absent optional fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier; the storage key within the event log.
    pub id: String,

    /// Who produced this event.
    pub author: String,

    /// Unix timestamp in milliseconds.
    pub timestamp: i64,

    /// Invocation/request this event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,

    /// Opaque content payload; not interpreted by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,

    /// Side effects to apply when the event is appended.
    #[serde(default, skip_serializing_if = "EventActions::is_empty")]
    pub actions: EventActions,

    /// Streaming fragment; never persisted and never mutates state.
    #[serde(default, skip_serializing_if = "is_false")]
    pub partial: bool,
}

impl Event {
    /// Create an event stamped with a fresh id and the current time.
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            author: author.into(),
            timestamp: Utc::now().timestamp_millis(),
            invocation_id: None,
            content: None,
            actions: EventActions::default(),
            partial: false,
        }
    }

    pub fn with_actions(mut self, actions: EventActions) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_invocation<S: Into<String>>(mut self, invocation_id: S) -> Self {
        self.invocation_id = Some(invocation_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark this event as a streaming fragment.
    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }
}
