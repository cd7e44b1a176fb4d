//! Top-level error type for the telemetry client
//!
//! Each subsystem has its own error enum; this module folds them into
//! [`TelemetryError`] for the public API surface.

use thiserror::Error;

/// Main error type for telemetry client operations
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Invalid settings: {0}")]
    InvalidSettings(#[from] crate::settings::SettingsError),

    #[error("Malformed reading: {0}")]
    Decode(#[from] crate::protocol::DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Notification error: {0}")]
    Notify(#[from] crate::notify::NotifyError),

    #[error("Connection manager has stopped")]
    ConnectionManagerStopped,

    #[error("Telemetry context has stopped")]
    ContextStopped,

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl TelemetryError {
    /// Wrap any transport-level error
    pub fn transport<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(error))
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

/// Result type for telemetry client operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;
