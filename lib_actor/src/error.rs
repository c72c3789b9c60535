//! Error model of the actor core.
//!
//! One variant per failure category; every component maps its own failures
//! into these before they cross a component boundary, so the lifecycle can
//! decide on retry/reboot by category alone.

use thiserror::Error;

/// Result alias used across the whole crate.
pub type Result<T> = std::result::Result<T, ActorError>;

#[derive(Debug, Error)]
pub enum ActorError {
    /// Transport level failure: connect, TLS handshake, timeout. The only
    /// category the retryable broker endpoints recover from locally.
    #[error("connection error: {0}")]
    Connection(String),

    /// The broker answered, but with an `error` field in the envelope or an
    /// unexpected payload.
    #[error("broker error: {0}")]
    Broker(String),

    /// The broker explicitly reported the machine as unmanaged.
    #[error("machine is unmanaged")]
    Unmanaged,

    /// The authentication token was rejected by the broker.
    #[error("invalid authentication token")]
    InvalidKey,

    /// Configuration could not be read, parsed or is missing required data.
    #[error("configuration error: {0}")]
    Config(String),

    /// An external command failed to launch or run.
    #[error("execution error: {0}")]
    Exec(String),

    /// An OS level operation failed.
    #[error("platform error: {0}")]
    Platform(String),

    /// Cooperative stop requested; treated as a clean exit, never logged as
    /// a failure.
    #[error("stop requested")]
    RequestStop,
}

impl ActorError {
    /// True when a retryable endpoint may try again.
    pub fn is_connection(&self) -> bool {
        matches!(self, ActorError::Connection(_))
    }
}

impl From<std::io::Error> for ActorError {
    fn from(e: std::io::Error) -> Self {
        ActorError::Platform(e.to_string())
    }
}

impl From<serde_json::Error> for ActorError {
    fn from(e: serde_json::Error) -> Self {
        ActorError::Broker(format!("unexpected payload: {e}"))
    }
}

impl From<reqwest::Error> for ActorError {
    fn from(e: reqwest::Error) -> Self {
        // Anything that never reached the peer (or timed out doing so) is a
        // connection error and thus retryable; the rest is a broker problem.
        if e.is_connect() || e.is_timeout() || e.is_request() {
            ActorError::Connection(e.to_string())
        } else {
            ActorError::Broker(e.to_string())
        }
    }
}
