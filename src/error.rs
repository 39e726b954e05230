//! Session engine error types.
//!
//! # Error Classification
//!
//! Every error carries a disposition the caller can act on without looking at
//! raw socket errors:
//!
//! | Class       | Variants                                                   | Caller action                 |
//! |-------------|------------------------------------------------------------|-------------------------------|
//! | `Retryable` | Transport, Protocol, NeedsReconnect, Timeout, Io, ResourceExhausted | Re-issue the whole operation |
//! | `Fatal`     | Authentication, Remote, Exiting, Config, Crypto, InvalidMessage, Cancelled | Surface upward       |
//!
//! Transport and protocol failures are handled locally by the transport layer
//! (which starts a reconnect) and reach in-flight callers as a retryable error.
//! `ResourceExhausted` never triggers a reconnect; the caller waits and retries
//! locally. The wire status of a failed response is kept on `Remote` and
//! `Authentication` for logging.

use std::time::Duration;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::protocol::{Command, Status};

/// Session engine errors.
#[derive(Error, Debug)]
pub enum CifsError {
    /// Connect refused or timed out, stream closed, malformed frame length.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame failed checksum or signature validation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection was re-established while the request was in flight.
    #[error("Connection needs reconnect")]
    NeedsReconnect,

    /// No response arrived within the request timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Too many concurrent requests for the negotiated limit.
    #[error("Too many requests in flight (limit {limit})")]
    ResourceExhausted {
        /// Negotiated in-flight limit.
        limit: usize,
    },

    /// Credentials rejected or unsupported capability combination.
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Wire status from the server, if the server answered.
        status: Option<Status>,
        /// Human-readable reason.
        message: String,
    },

    /// The server answered with a failure status.
    #[error("{command:?} failed with status {status}")]
    Remote {
        /// Command that failed.
        command: Command,
        /// Wire status returned.
        status: Status,
    },

    /// The transport or session is shutting down permanently.
    #[error("Connection is exiting")]
    Exiting,

    /// The caller abandoned the request.
    #[error("Request cancelled")]
    Cancelled,

    /// Payload could not be decoded.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for session engine operations
pub type Result<T> = std::result::Result<T, CifsError>;

/// What a caller should do with a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Re-issue the operation; the session will be re-validated first.
    Retryable,
    /// Give up and surface the failure.
    Fatal,
}

impl CifsError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            CifsError::Transport(_)
            | CifsError::Protocol(_)
            | CifsError::NeedsReconnect
            | CifsError::Timeout(_)
            | CifsError::ResourceExhausted { .. }
            | CifsError::Io(_) => ErrorClass::Retryable,
            CifsError::Authentication { .. }
            | CifsError::Remote { .. }
            | CifsError::Exiting
            | CifsError::Cancelled
            | CifsError::InvalidMessage(_)
            | CifsError::Config(_)
            | CifsError::Crypto(_) => ErrorClass::Fatal,
        }
    }

    /// Shorthand for `class() == ErrorClass::Retryable`.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Wire status attached to this error, for logging.
    pub fn wire_status(&self) -> Option<Status> {
        match self {
            CifsError::Remote { status, .. } => Some(*status),
            CifsError::Authentication { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<CryptoError> for CifsError {
    fn from(err: CryptoError) -> Self {
        CifsError::Crypto(err)
    }
}

impl From<toml::de::Error> for CifsError {
    fn from(err: toml::de::Error) -> Self {
        CifsError::Config(err.to_string())
    }
}
