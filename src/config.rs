//! Store configuration and construction
//!
//! TOML configuration with environment variable overrides, plus the store
//! URI factory: `sled://` locations for the persistent backend and
//! `memory://` for the ephemeral one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::{Result, StoreError};
use crate::service::{SessionService, DEFAULT_DELETE_PAGE_SIZE};
use crate::store::sled::default_db_path;
use crate::store::{DocumentStore, MemoryStore, SledStore};

/// Environment override for the store URI.
pub const URI_ENV: &str = "AGENT_SESSIONS_URI";
/// Environment override for the deletion page size.
pub const DELETE_PAGE_SIZE_ENV: &str = "AGENT_SESSIONS_DELETE_PAGE_SIZE";

const DEFAULT_DB_NAME: &str = "sessions.db";

fn default_uri() -> String {
    "sled://default".to_string()
}

fn default_delete_page_size() -> usize {
    DEFAULT_DELETE_PAGE_SIZE
}

/// Store settings, loadable from TOML with environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store location: `sled://default`, `sled://default/<db-name>`,
    /// `sled:///absolute/path`, `sled://relative/path`, or `memory://`.
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Page size for event-log teardown during session deletion.
    #[serde(default = "default_delete_page_size")]
    pub delete_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            delete_page_size: default_delete_page_size(),
        }
    }
}

impl StoreConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides; no file involved.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(uri) = std::env::var(URI_ENV) {
            if !uri.is_empty() {
                self.uri = uri;
            }
        }
        if let Ok(raw) = std::env::var(DELETE_PAGE_SIZE_ENV) {
            match raw.parse::<usize>() {
                Ok(size) if size > 0 => self.delete_page_size = size,
                _ => warn!(value = %raw, "ignoring invalid delete page size override"),
            }
        }
    }
}

/// Build a document store from its URI.
pub fn store_from_uri(uri: &str) -> Result<Arc<dyn DocumentStore>> {
    let parsed = Url::parse(uri).map_err(|err| StoreError::InvalidUri {
        uri: uri.to_string(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "sled" => Ok(Arc::new(SledStore::open(sled_path(&parsed)?)?)),
        other => Err(StoreError::InvalidUri {
            uri: uri.to_string(),
            reason: format!("unsupported scheme `{other}`"),
        }),
    }
}

/// Filesystem location named by a `sled://` URI.
///
/// A `default` (or empty) host means the platform default location, with
/// an optional database name as the path; any other host starts a
/// filesystem path, absolute when the host is empty.
fn sled_path(parsed: &Url) -> Result<PathBuf> {
    let host = parsed.host_str().unwrap_or("");
    let tail = parsed.path().trim_start_matches('/');
    match (host, tail) {
        ("" | "default", "") => default_db_path(DEFAULT_DB_NAME),
        ("default", name) => default_db_path(name),
        ("", abs) => Ok(Path::new("/").join(abs)),
        (host, "") => Ok(PathBuf::from(host)),
        (host, tail) => Ok(PathBuf::from(host).join(tail)),
    }
}

impl SessionService {
    /// Build a service over the store named by `uri`.
    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(Self::new(store_from_uri(uri)?))
    }

    /// Build a service from configuration.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Ok(Self::new(store_from_uri(&config.uri)?).with_delete_page_size(config.delete_page_size))
    }
}
