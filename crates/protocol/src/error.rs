//! Error types for the protocol crate.

use thiserror::Error;

/// Transport error type covering the failure modes of a terminal transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Session with the given ID was not found.
    #[error("session not found: {session_id}")]
    SessionNotFound {
        /// The missing session identifier.
        session_id: String,
    },

    /// Connection to the host was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The host refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Local I/O failure while talking to the host.
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Shorthand for [`TransportError::SessionNotFound`].
    pub fn not_found(session_id: impl Into<String>) -> Self {
        TransportError::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Returns true when the error reports a missing session.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::SessionNotFound { .. })
    }

    /// Returns true when the error was produced by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => TransportError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportError::ConnectionClosed(err.to_string()),
            _ => TransportError::Io(err.to_string()),
        }
    }
}
