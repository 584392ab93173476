//! Tiered session-state persistence for conversational agents
//!
//! Sessions, their append-only event logs, and three tiers of state live
//! in a hierarchical document store behind the
//! [`store::DocumentStore`] trait. State keys are routed to a tier by a
//! reserved prefix:
//! - `app:` - application-scoped, shared by every user of an application
//! - `user:` - user-scoped, shared across that user's sessions
//! - `temp:` - transient, never persisted
//! - (no prefix) - session-scoped (default)
//!
//! Reads return the session with application- and user-tier state
//! overlaid under their prefixes; appending an event routes its state
//! delta to the tier documents and commits them with the event record as
//! one atomic batch.

pub mod config;
pub mod error;
pub mod event;
pub mod scope;
pub mod service;
pub mod session;
pub mod store;

pub use config::{store_from_uri, StoreConfig};
pub use error::{Result, StoreError};
pub use event::{Event, EventActions};
pub use scope::StateScope;
pub use service::SessionService;
pub use session::{GetSessionOptions, Session};
pub use store::{DocumentStore, MemoryStore, SledStore};
