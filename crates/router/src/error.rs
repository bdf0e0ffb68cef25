//! Error types for the router crate.

use protocol::TransportError;
use thiserror::Error;

/// Errors surfaced to router callers.
///
/// Only [`SessionRouter::resize`](crate::SessionRouter::resize) returns one;
/// every other operation is infallible from the caller's point of view.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The router was disposed and no longer talks to its transport.
    #[error("session router has been disposed")]
    Disposed,

    /// The transport rejected the request.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type alias for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;
