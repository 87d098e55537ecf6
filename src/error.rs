//! AMTP error types.
//!
//! Every public operation fails with exactly one [`AmtpError`] kind. Gateway
//! round-trips that fail at the transport level carry a [`TransportError`],
//! which distinguishes connection-level faults (retried locally with backoff)
//! from application responses (surfaced immediately).

use thiserror::Error;

use crate::schema::SchemaViolation;

/// AMTP client errors.
#[derive(Error, Debug)]
pub enum AmtpError {
    /// Gateway unreachable or the liveness check failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Registration with the gateway failed.
    #[error("Registration error: {0}")]
    Registration(String),

    /// Malformed message or schema.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No schema registered under the requested id.
    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    /// Payload does not conform to its schema.
    #[error("Schema validation failed at {0}")]
    SchemaValidation(SchemaViolation),

    /// Pull-only operation invoked on a push-mode session.
    #[error("Mode error: {0}")]
    Mode(String),

    /// Serialized message exceeds the configured quota.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Serialized size in bytes.
        size: usize,
        /// Configured maximum in bytes.
        max: usize,
    },

    /// Gateway request failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Session start failed; the session was torn down.
    #[error("Failed to start session: {0}")]
    Start(#[source] Box<AmtpError>),

    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias for AMTP operations
pub type Result<T> = std::result::Result<T, AmtpError>;

/// Outcome classification of a single logical gateway request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// HTTP 400.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// HTTP 401.
    #[error("Authentication failed")]
    Unauthorized,

    /// HTTP 404.
    #[error("Not found")]
    NotFound,

    /// HTTP 429.
    #[error("Rate limited")]
    RateLimited,

    /// Any other non-success status.
    #[error("HTTP {status}: {message}")]
    ServerError {
        /// Raw status code.
        status: u16,
        /// Gateway-provided error text.
        message: String,
    },

    /// The last attempt timed out.
    #[error("Request timed out")]
    Timeout,

    /// The last attempt failed at the network level.
    #[error("Request failed: {0}")]
    RequestFailed(String),
}

impl TransportError {
    /// HTTP status behind this error, if the gateway answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::BadRequest(_) => Some(400),
            Self::Unauthorized => Some(401),
            Self::NotFound => Some(404),
            Self::RateLimited => Some(429),
            Self::ServerError { status, .. } => Some(*status),
            Self::Timeout | Self::RequestFailed(_) => None,
        }
    }

    /// Whether the failure happened below the HTTP layer.
    pub fn is_connection_level(&self) -> bool {
        self.status().is_none()
    }
}

impl From<serde_json::Error> for AmtpError {
    fn from(err: serde_json::Error) -> Self {
        AmtpError::Validation(format!("Invalid JSON: {err}"))
    }
}
