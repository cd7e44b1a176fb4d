//! Key-value persistence collaborator
//!
//! Settings and history are persisted as JSON strings under fixed keys.
//! Each key is owned by exactly one component, so writes to a key never
//! interleave with writes from another component.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

/// Key under which the user settings record is stored
pub const SETTINGS_KEY: &str = "co2_settings";

/// Key under which the reading history is stored
pub const HISTORY_KEY: &str = "co2_historical_data";

/// Get/set-by-key persistence
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value for `key`, `Ok(None)` if it was never written
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Replace the value for `key`
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O failed for key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid storage key: '{0}'")]
    InvalidKey(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn io<S: Into<String>>(key: S, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }
}
