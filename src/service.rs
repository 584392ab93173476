//! Session service - lifecycle, tier merge, and atomic event append
//!
//! The service routes state updates to their tier documents, overlays
//! application and user state onto the session view returned to callers,
//! and appends events atomically alongside the state writes they imply.
//! There is no internal locking; the store's batch commit is the sole
//! atomicity boundary, and concurrent appends to the same session rely on
//! the store's per-batch atomicity alone.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::event::Event;
use crate::scope::StateScope;
use crate::session::{GetSessionOptions, Session};
use crate::store::{
    to_document, CollectionPath, DocPath, Document, DocumentStore, Query, WriteBatch,
};

/// Default page size for event-log teardown during session deletion.
pub const DEFAULT_DELETE_PAGE_SIZE: usize = 50;

/// Persists sessions, their event logs, and tiered state in a
/// hierarchical document store.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn DocumentStore>,
    delete_page_size: usize,
}

impl SessionService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            delete_page_size: DEFAULT_DELETE_PAGE_SIZE,
        }
    }

    /// Tune the page size used when draining an event log on deletion.
    /// Values below 1 are clamped to 1.
    pub fn with_delete_page_size(mut self, page_size: usize) -> Self {
        self.delete_page_size = page_size.max(1);
        self
    }

    /// Handle to the backing store, for callers that need direct access.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Create a session.
    ///
    /// A blank-after-trim or absent `session_id` gets a generated UUID;
    /// collisions are not checked against existing documents. The returned
    /// session carries the merged tier view and an empty event list.
    pub async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<Document>,
        session_id: Option<&str>,
    ) -> Result<Session> {
        let id = session_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut session = Session {
            id,
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            state: state.unwrap_or_default(),
            events: Vec::new(),
            last_update_time: Utc::now().timestamp_millis(),
        };

        self.store
            .set(
                &DocPath::session(app_name, user_id, &session.id),
                session.to_document(),
            )
            .await?;
        debug!(app_name, user_id, session_id = %session.id, "created session");

        self.merge_state(&mut session).await?;
        Ok(session)
    }

    /// Fetch a session with its event log and merged tier view.
    ///
    /// Returns `Ok(None)` if the session does not exist. Events are
    /// attached in ascending timestamp order; `options` can bound them to
    /// those strictly after a timestamp, or to the N most recent (fetched
    /// descending with a limit, then re-sorted ascending). Events that
    /// fail to decode are skipped.
    pub async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        options: Option<GetSessionOptions>,
    ) -> Result<Option<Session>> {
        let path = DocPath::session(app_name, user_id, session_id);
        let Some(doc) = self.store.get(&path).await? else {
            return Ok(None);
        };
        let mut session = Session::from_document(doc, app_name, user_id, session_id);

        let options = options.unwrap_or_default();
        let mut query = match options.num_recent_events {
            Some(count) => Query::descending("timestamp").limit(count),
            None => Query::ascending("timestamp"),
        };
        if let Some(after) = options.after_timestamp {
            query = query.greater_than("timestamp", Value::from(after));
        }

        let records = self
            .store
            .query(&CollectionPath::events(app_name, user_id, session_id), query)
            .await?;
        let mut events: Vec<Event> = records
            .into_iter()
            .filter_map(|(id, doc)| match serde_json::from_value(Value::Object(doc)) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(event_id = %id, error = %err, "skipping undecodable event record");
                    None
                }
            })
            .collect();
        if options.num_recent_events.is_some() {
            events.sort_by_key(|event| event.timestamp);
        }
        session.events = events;

        self.merge_state(&mut session).await?;
        Ok(Some(session))
    }

    /// List sessions for a user, most recently updated first.
    ///
    /// Event lists are always empty in listings. Entries that fail to
    /// decode are skipped rather than failing the listing.
    pub async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>> {
        let records = self
            .store
            .query(
                &CollectionPath::sessions(app_name, user_id),
                Query::descending("last_update_time"),
            )
            .await?;

        let mut sessions = Vec::with_capacity(records.len());
        for (id, doc) in records {
            match serde_json::from_value::<Session>(Value::Object(doc)) {
                Ok(mut session) => {
                    self.merge_state(&mut session).await?;
                    sessions.push(session);
                }
                Err(err) => {
                    warn!(session_id = %id, error = %err, "skipping undecodable session record");
                }
            }
        }
        Ok(sessions)
    }

    /// Delete a session and its entire event log.
    ///
    /// The store does not cascade into sub-collections, so the event log
    /// is drained page by page first; the loop ends when a page comes back
    /// short. Deleting an absent session is a no-op.
    pub async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<()> {
        let events = CollectionPath::events(app_name, user_id, session_id);
        loop {
            let page = self
                .store
                .query(
                    &events,
                    Query::ascending("timestamp").limit(self.delete_page_size),
                )
                .await?;
            let fetched = page.len();
            for (event_id, _) in page {
                self.store.delete(&events.doc(&event_id)).await?;
            }
            if fetched < self.delete_page_size {
                break;
            }
        }

        self.store
            .delete(&DocPath::session(app_name, user_id, session_id))
            .await?;
        debug!(app_name, user_id, session_id, "deleted session");
        Ok(())
    }

    /// Append an event to a session, routing its state delta to the tier
    /// documents and committing everything as one atomic batch.
    ///
    /// Partial events are returned unchanged with no persistence and no
    /// mutation. Otherwise the in-memory session is mutated first (state
    /// under full scoped keys, event list, timestamp) and the batch is
    /// committed second - so on a failed commit the in-memory session is
    /// ahead of the store. Transient and invalid keys are dropped from
    /// both the in-memory view and the writes.
    pub async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event> {
        if event.partial {
            return Ok(event);
        }

        let mut app_updates = Document::new();
        let mut user_updates = Document::new();
        let mut session_updates = Document::new();
        for (key, value) in &event.actions.state_delta {
            let Some((scope, stripped)) = StateScope::split(key) else {
                continue;
            };
            match scope {
                StateScope::Temp => continue,
                StateScope::App => {
                    app_updates.insert(stripped.to_string(), value.clone());
                }
                StateScope::User => {
                    user_updates.insert(stripped.to_string(), value.clone());
                }
                StateScope::Session => {
                    session_updates.insert(format!("state.{stripped}"), value.clone());
                }
            }
            // The in-memory view keeps the full scoped key, matching what
            // the merge engine would produce on the next read.
            session.state.insert(key.clone(), value.clone());
        }
        session.last_update_time = event.timestamp;
        session.events.push(event.clone());

        let app_name = session.app_name.clone();
        let user_id = session.user_id.clone();

        let mut batch = WriteBatch::new();
        batch.set(
            DocPath::event(&app_name, &user_id, &session.id, &event.id),
            to_document(&event)?,
        );
        if !app_updates.is_empty() {
            batch.merge(DocPath::application(&app_name), app_updates);
        }
        if !user_updates.is_empty() {
            batch.merge(DocPath::user(&app_name, &user_id), user_updates);
        }
        session_updates.insert(
            "last_update_time".to_string(),
            Value::from(session.last_update_time),
        );
        batch.update(
            DocPath::session(&app_name, &user_id, &session.id),
            session_updates,
        );

        self.store.commit(batch).await?;
        debug!(
            app_name = %app_name,
            user_id = %user_id,
            session_id = %session.id,
            event_id = %event.id,
            "appended event"
        );
        Ok(event)
    }

    /// Overlay application- and user-tier state onto the session's view.
    ///
    /// Two independent point reads; a missing tier document contributes
    /// nothing. Tier keys overwrite same-named entries already in the map,
    /// so merging twice against an unchanged store is idempotent.
    async fn merge_state(&self, session: &mut Session) -> Result<()> {
        if let Some(app_doc) = self
            .store
            .get(&DocPath::application(&session.app_name))
            .await?
        {
            for (key, value) in app_doc {
                session
                    .state
                    .insert(format!("{}{key}", StateScope::App.prefix()), value);
            }
        }
        if let Some(user_doc) = self
            .store
            .get(&DocPath::user(&session.app_name, &session.user_id))
            .await?
        {
            for (key, value) in user_doc {
                session
                    .state
                    .insert(format!("{}{key}", StateScope::User.prefix()), value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventActions;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn service() -> SessionService {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("agent_sessions=debug")
            .try_init();
        SessionService::new(Arc::new(MemoryStore::new()))
    }

    fn doc(pairs: &[(&str, Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn stamped(author: &str, timestamp: i64, delta: &[(&str, Value)]) -> Event {
        let mut actions = EventActions::default();
        for (key, value) in delta {
            actions.state_delta.insert(key.to_string(), value.clone());
        }
        Event::new(author)
            .with_timestamp(timestamp)
            .with_actions(actions)
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let service = service();
        let session = service
            .create_session("app", "u1", Some(doc(&[("x", json!(1))])), Some("s-1"))
            .await
            .unwrap();
        assert_eq!(session.id, "s-1");
        assert!(session.events.is_empty());

        let fetched = service
            .get_session("app", "u1", "s-1", None)
            .await
            .unwrap()
            .expect("session should exist");
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.app_name, "app");
        assert_eq!(fetched.user_id, "u1");
        assert_eq!(fetched.state.get("x"), Some(&json!(1)));
        assert_eq!(fetched.last_update_time, session.last_update_time);
    }

    #[tokio::test]
    async fn test_get_absent_returns_none() {
        let service = service();
        let fetched = service.get_session("app", "u1", "missing", None).await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn test_blank_requested_id_generates_one() {
        let service = service();
        let a = service
            .create_session("app", "u1", None, Some("   "))
            .await
            .unwrap();
        let b = service.create_session("app", "u1", None, None).await.unwrap();
        assert!(!a.id.trim().is_empty());
        assert_ne!(a.id, b.id);
        // Generated ids are UUIDs, not trimmed echoes of the blank input.
        assert_eq!(a.id.len(), 36);
    }

    #[tokio::test]
    async fn test_merge_overlays_tier_documents() {
        let service = service();
        let store = service.store().clone();
        store
            .set(
                &DocPath::application("app"),
                doc(&[("global_config", json!("true"))]),
            )
            .await
            .unwrap();
        store
            .set(
                &DocPath::user("app", "u1"),
                doc(&[("user_pref", json!("dark_mode"))]),
            )
            .await
            .unwrap();

        let session = service
            .create_session("app", "u1", Some(doc(&[("session_var", json!(123))])), None)
            .await
            .unwrap();
        assert_eq!(session.state.get("app:global_config"), Some(&json!("true")));
        assert_eq!(session.state.get("user:user_pref"), Some(&json!("dark_mode")));
        assert_eq!(session.state.get("session_var"), Some(&json!(123)));

        // Tier keys exist only in the merged view, not in the stored document.
        let stored = store
            .get(&DocPath::session("app", "u1", &session.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("state"), Some(&json!({"session_var": 123})));
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let service = service();
        let store = service.store().clone();
        store
            .set(&DocPath::application("app"), doc(&[("k", json!(1))]))
            .await
            .unwrap();
        let session = service.create_session("app", "u1", None, None).await.unwrap();

        let first = service
            .get_session("app", "u1", &session.id, None)
            .await
            .unwrap()
            .unwrap();
        let second = service
            .get_session("app", "u1", &session.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.state, second.state);
    }

    #[tokio::test]
    async fn test_append_event_routes_state_to_tiers() {
        let service = service();
        let store = service.store().clone();
        // Pre-existing application state must survive unrelated merges.
        store
            .set(&DocPath::application("app"), doc(&[("motd", json!("hi"))]))
            .await
            .unwrap();

        let mut session = service
            .create_session("app", "u1", Some(doc(&[("x", json!(1))])), None)
            .await
            .unwrap();
        let event = stamped(
            "agent",
            2_000,
            &[
                ("app:counter", json!(1)),
                ("user:name", json!("a")),
                ("y", json!(2)),
            ],
        );
        let event_id = event.id.clone();
        service.append_event(&mut session, event).await.unwrap();

        // In-memory view carries the full scoped keys immediately.
        assert_eq!(session.state.get("x"), Some(&json!(1)));
        assert_eq!(session.state.get("y"), Some(&json!(2)));
        assert_eq!(session.state.get("app:counter"), Some(&json!(1)));
        assert_eq!(session.state.get("user:name"), Some(&json!("a")));
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.last_update_time, 2_000);

        // Tier documents got the stripped keys; unrelated fields intact.
        let app_doc = store.get(&DocPath::application("app")).await.unwrap().unwrap();
        assert_eq!(app_doc.get("counter"), Some(&json!(1)));
        assert_eq!(app_doc.get("motd"), Some(&json!("hi")));
        let user_doc = store.get(&DocPath::user("app", "u1")).await.unwrap().unwrap();
        assert_eq!(user_doc.get("name"), Some(&json!("a")));

        // Session document holds only session-local keys.
        let stored = store
            .get(&DocPath::session("app", "u1", &session.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("state"), Some(&json!({"x": 1, "y": 2})));
        assert_eq!(stored.get("last_update_time"), Some(&json!(2_000)));

        // The event record landed in the sub-collection.
        let stored_event = store
            .get(&DocPath::event("app", "u1", &session.id, &event_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_event.get("author"), Some(&json!("agent")));

        // A fresh read shows the same merged view.
        let fetched = service
            .get_session("app", "u1", &session.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.state.get("y"), Some(&json!(2)));
        assert_eq!(fetched.state.get("app:counter"), Some(&json!(1)));
        assert_eq!(fetched.events.len(), 1);

        // Application state is shared across users; user state is not.
        let other = service.create_session("app", "u2", None, None).await.unwrap();
        assert_eq!(other.state.get("app:counter"), Some(&json!(1)));
        assert_eq!(other.state.get("user:name"), None);
    }

    #[tokio::test]
    async fn test_transient_keys_never_persisted() {
        let service = service();
        let store = service.store().clone();
        let mut session = service.create_session("app", "u1", None, None).await.unwrap();

        let event = stamped(
            "agent",
            1_000,
            &[("temp:scratch", json!("v")), ("keep", json!(1))],
        );
        service.append_event(&mut session, event).await.unwrap();

        assert_eq!(session.state.get("temp:scratch"), None);
        assert_eq!(session.state.get("keep"), Some(&json!(1)));

        let stored = store
            .get(&DocPath::session("app", "u1", &session.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("state"), Some(&json!({"keep": 1})));
        let fetched = service
            .get_session("app", "u1", &session.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.state.get("temp:scratch"), None);
    }

    #[tokio::test]
    async fn test_invalid_delta_keys_dropped() {
        let service = service();
        let store = service.store().clone();
        let mut session = service.create_session("app", "u1", None, None).await.unwrap();

        let event = stamped(
            "agent",
            1_000,
            &[("", json!(1)), ("app:", json!(2)), ("user:", json!(3))],
        );
        service.append_event(&mut session, event).await.unwrap();

        assert!(session.state.is_empty());
        assert!(store.get(&DocPath::application("app")).await.unwrap().is_none());
        assert!(store.get(&DocPath::user("app", "u1")).await.unwrap().is_none());
        let stored = store
            .get(&DocPath::session("app", "u1", &session.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("state"), Some(&json!({})));
    }

    #[tokio::test]
    async fn test_partial_event_is_a_no_op() {
        let service = service();
        let store = service.store().clone();
        let mut session = service.create_session("app", "u1", None, None).await.unwrap();
        let created_at = session.last_update_time;

        let event = stamped("agent", 9_000, &[("x", json!(1))]).partial();
        let returned = service.append_event(&mut session, event).await.unwrap();
        assert!(returned.partial);

        assert!(session.state.is_empty());
        assert!(session.events.is_empty());
        assert_eq!(session.last_update_time, created_at);
        let events = store
            .query(
                &CollectionPath::events("app", "u1", &session.id),
                Query::ascending("timestamp"),
            )
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_events_ordered_and_filtered() {
        let service = service();
        let mut session = service.create_session("app", "u1", None, None).await.unwrap();
        for ts in [1_000, 2_000, 3_000, 4_000, 5_000] {
            let event = stamped("agent", ts, &[("step", json!(ts))]);
            service.append_event(&mut session, event).await.unwrap();
        }

        let all = service
            .get_session("app", "u1", &session.id, None)
            .await
            .unwrap()
            .unwrap();
        let stamps: Vec<_> = all.events.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, [1_000, 2_000, 3_000, 4_000, 5_000]);

        // The N most recent, still ascending after the descending fetch.
        let recent = service
            .get_session(
                "app",
                "u1",
                &session.id,
                Some(GetSessionOptions {
                    num_recent_events: Some(3),
                    ..Default::default()
                }),
            )
            .await
            .unwrap()
            .unwrap();
        let stamps: Vec<_> = recent.events.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, [3_000, 4_000, 5_000]);

        // Strictly-after filter.
        let after = service
            .get_session(
                "app",
                "u1",
                &session.id,
                Some(GetSessionOptions {
                    after_timestamp: Some(2_000),
                    ..Default::default()
                }),
            )
            .await
            .unwrap()
            .unwrap();
        let stamps: Vec<_> = after.events.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, [3_000, 4_000, 5_000]);
    }

    #[tokio::test]
    async fn test_list_sessions_ordering() {
        let service = service();
        let mut s1 = service.create_session("app", "u1", None, Some("s1")).await.unwrap();
        let mut s2 = service.create_session("app", "u1", None, Some("s2")).await.unwrap();
        let mut s3 = service.create_session("app", "u1", None, Some("s3")).await.unwrap();

        for (session, ts) in [(&mut s1, 1_000), (&mut s2, 2_000), (&mut s3, 3_000)] {
            let event = stamped("agent", ts, &[("k", json!(ts))]);
            service.append_event(session, event).await.unwrap();
        }

        let listed = service.list_sessions("app", "u1").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["s3", "s2", "s1"]);
        // Listings never carry event logs.
        assert!(listed.iter().all(|s| s.events.is_empty()));

        // Appending to the oldest session moves it to the front.
        let event = stamped("agent", 4_000, &[("k", json!(4))]);
        service.append_event(&mut s1, event).await.unwrap();
        let listed = service.list_sessions("app", "u1").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["s1", "s3", "s2"]);
    }

    #[tokio::test]
    async fn test_delete_session_cascades_to_events() {
        let service = service();
        let store = service.store().clone();
        let mut session = service.create_session("app", "u1", None, None).await.unwrap();
        for ts in [1_000, 2_000, 3_000] {
            let event = stamped("agent", ts, &[]);
            service.append_event(&mut session, event).await.unwrap();
        }

        service.delete_session("app", "u1", &session.id).await.unwrap();
        assert!(service
            .get_session("app", "u1", &session.id, None)
            .await
            .unwrap()
            .is_none());
        let events = store
            .query(
                &CollectionPath::events("app", "u1", &session.id),
                Query::ascending("timestamp"),
            )
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_delete_drains_logs_larger_than_one_page() {
        let service = service().with_delete_page_size(2);
        let store = service.store().clone();
        let mut session = service.create_session("app", "u1", None, None).await.unwrap();
        for ts in 1..=5 {
            let event = stamped("agent", ts * 1_000, &[]);
            service.append_event(&mut session, event).await.unwrap();
        }

        service.delete_session("app", "u1", &session.id).await.unwrap();
        let events = store
            .query(
                &CollectionPath::events("app", "u1", &session.id),
                Query::ascending("timestamp"),
            )
            .await
            .unwrap();
        assert!(events.is_empty());

        // Deleting a session that never existed is a no-op.
        service.delete_session("app", "u1", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_session_document_recovered() {
        let service = service();
        let store = service.store().clone();
        // Identifiers missing entirely; only a state fragment survives.
        store
            .set(
                &DocPath::session("app", "u1", "broken"),
                doc(&[("state", json!({"k": "v"}))]),
            )
            .await
            .unwrap();

        let session = service
            .get_session("app", "u1", "broken", None)
            .await
            .unwrap()
            .expect("best-effort reconstruction, not an error");
        assert_eq!(session.id, "broken");
        assert_eq!(session.state.get("k"), Some(&json!("v")));
        assert_eq!(session.last_update_time, 0);
    }

    #[tokio::test]
    async fn test_undecodable_events_skipped() {
        let service = service();
        let store = service.store().clone();
        let mut session = service.create_session("app", "u1", None, None).await.unwrap();
        let event = stamped("agent", 1_000, &[]);
        service.append_event(&mut session, event).await.unwrap();
        // A record missing required event fields sits alongside the good one.
        store
            .set(
                &CollectionPath::events("app", "u1", &session.id).doc("junk"),
                doc(&[("timestamp", json!(2_000))]),
            )
            .await
            .unwrap();

        let fetched = service
            .get_session("app", "u1", &session.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.events.len(), 1);
        assert_eq!(fetched.events[0].timestamp, 1_000);
    }

    #[tokio::test]
    async fn test_list_skips_undecodable_entries() {
        let service = service();
        let store = service.store().clone();
        service.create_session("app", "u1", None, Some("good")).await.unwrap();
        store
            .set(
                &CollectionPath::sessions("app", "u1").doc("junk"),
                doc(&[("id", json!(123))]),
            )
            .await
            .unwrap();

        let listed = service.list_sessions("app", "u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "good");
    }
}
