//! Error type for the session store.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures surfaced by the store and the session service.
///
/// Absence is not an error: point reads return `Ok(None)` and deleting a
/// missing document is a no-op. Backend failures propagate unchanged; retry
/// policy belongs to the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A field-level update targeted a document that does not exist.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error(transparent)]
    Backend(#[from] sled::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A blocking storage task was cancelled or panicked.
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("invalid store uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error(transparent)]
    ConfigParse(#[from] toml::de::Error),

    #[error("config error: {0}")]
    Config(String),
}
