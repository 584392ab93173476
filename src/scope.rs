//! State key scoping - prefix-based routing of state keys to tiers
//!
//! State keys carry a reserved prefix naming the tier they persist to:
//! - `app:` - application-scoped, shared by every user of the application
//! - `user:` - user-scoped, shared across that user's sessions
//! - `temp:` - transient, never persisted
//! - (no prefix) - session-scoped (default)
//!
//! All classification goes through [`StateScope::split`]; nothing else in
//! the crate inspects key prefixes directly.

/// Prefix for application-scoped state keys.
pub const APP_PREFIX: &str = "app:";
/// Prefix for user-scoped state keys.
pub const USER_PREFIX: &str = "user:";
/// Prefix for transient state keys.
pub const TEMP_PREFIX: &str = "temp:";

/// The tier a state key persists to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateScope {
    /// Application scope - one document per application.
    App,
    /// User scope - one document per (application, user).
    User,
    /// Session scope - stored in the session document (default).
    Session,
    /// Transient - discarded, never persisted.
    Temp,
}

impl StateScope {
    /// Classify a key and return it with its scope prefix stripped.
    ///
    /// Precedence when prefixes could ambiguously match: `temp:` first,
    /// then `app:`, then `user:`; anything else is session-scoped and kept
    /// whole. Returns `None` for invalid keys - the empty key, or a key
    /// that is exactly a reserved prefix with nothing after it. Invalid
    /// keys are silently dropped by every consumer rather than rejected
    /// with an error.
    pub fn split(key: &str) -> Option<(StateScope, &str)> {
        if let Some(rest) = key.strip_prefix(TEMP_PREFIX) {
            (!rest.is_empty()).then_some((StateScope::Temp, rest))
        } else if let Some(rest) = key.strip_prefix(APP_PREFIX) {
            (!rest.is_empty()).then_some((StateScope::App, rest))
        } else if let Some(rest) = key.strip_prefix(USER_PREFIX) {
            (!rest.is_empty()).then_some((StateScope::User, rest))
        } else if key.is_empty() {
            None
        } else {
            Some((StateScope::Session, key))
        }
    }

    /// The prefix re-attached when presenting a key in the merged view.
    pub fn prefix(&self) -> &'static str {
        match self {
            StateScope::App => APP_PREFIX,
            StateScope::User => USER_PREFIX,
            StateScope::Temp => TEMP_PREFIX,
            StateScope::Session => "",
        }
    }

    /// Whether keys in this scope are written to the store at all.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, StateScope::Temp)
    }
}
