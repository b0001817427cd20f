//! Error types for configuration loading and the save trigger's outbound HTTP call.

use thiserror::Error;

/// Errors raised while loading and validating [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid PORT: {0}")]
    InvalidPort(String),
    #[error("MAX_CLIENTS_PER_ROOM must be >= 1, got {0}")]
    InvalidMaxClientsPerRoom(usize),
    #[error("WEBSOCKET_PING_INTERVAL must be >= 1000ms, got {0}")]
    InvalidPingInterval(u64),
    #[error("GRACE_PERIOD_MS must be >= 5000ms, got {0}")]
    InvalidGracePeriod(u64),
    #[error("API_BASE_URL is not a valid URL: {0}")]
    InvalidApiBaseUrl(String),
}

/// Errors raised by [`crate::save`]'s persistence call.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("room '{0}' is not a code-editor room")]
    NotCodeEditorRoom(String),
    #[error("save request failed with status {status}: {status_text}")]
    BadStatus { status: u16, status_text: String },
    #[error("save request failed: {0}")]
    Request(String),
}
