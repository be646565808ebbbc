//! Error taxonomy shared across the homelink crates.

use thiserror::Error;

/// Errors raised while validating or normalizing an [`crate::endpoint::Endpoint`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("hostname must not be empty")]
    InvalidHostname,
    #[error("invalid port {port}")]
    InvalidPort { port: u32 },
    #[error("invalid url: {reason}")]
    InvalidUrl { reason: String },
}

/// Errors raised by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// A server-reported or transport-surfaced failure for a single request.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("token unavailable: {0}")]
    TokenUnavailable(String),
    #[error("server returned error {code}: {message}")]
    External { code: String, message: String },
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result alias for endpoint/config validation.
pub type ConfigResult<T> = Result<T, ConfigError>;
/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
/// Result alias for a single request/subscription outcome.
pub type ApiResult<T> = Result<T, ApiError>;
