//! The upstream transport contract.
//!
//! A transport is whatever carries terminal traffic between a viewer process
//! and the host that owns the PTY: an RPC client, a local PTY backend, or the
//! in-memory [`MemoryTransport`](crate::memory::MemoryTransport) used in tests.
//! The router only ever talks to this trait.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::messages::{ExitCode, TerminalEvent};

/// Stream of output/state events for one session.
pub type EventStream = BoxStream<'static, Result<TerminalEvent>>;

/// Stream carrying at most one exit code for one session.
pub type ExitStream = BoxStream<'static, Result<ExitCode>>;

/// A transport shared between the router and its owner.
pub type SharedTransport = Arc<dyn TerminalTransport>;

/// Operations a terminal host exposes to viewers.
///
/// Streams returned by [`attach`](Self::attach) and [`on_exit`](Self::on_exit)
/// must end (or yield [`TransportError::Cancelled`](crate::TransportError::Cancelled))
/// once the supplied token is cancelled. All futures are `'static` so callers
/// can move them onto spawned tasks.
pub trait TerminalTransport: Send + Sync {
    /// Opens the output/state stream of a session.
    fn attach(&self, session_id: &str, cancel: CancellationToken) -> EventStream;

    /// Opens the exit stream of a session.
    fn on_exit(&self, session_id: &str, cancel: CancellationToken) -> ExitStream;

    /// Writes input to a session.
    fn send_input(&self, session_id: &str, data: &str) -> BoxFuture<'static, Result<()>>;

    /// Resizes a session's terminal.
    fn resize(&self, session_id: &str, cols: u16, rows: u16) -> BoxFuture<'static, Result<()>>;

    /// Terminates a session on the host.
    fn close(&self, session_id: &str) -> BoxFuture<'static, Result<()>>;
}

/// Ends `stream` as soon as `cancel` fires.
pub fn cancellable<S, T>(stream: S, cancel: CancellationToken) -> BoxStream<'static, T>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
{
    stream.take_until(cancel.cancelled_owned()).boxed()
}

/// Boxes a future into the shape the transport methods return.
pub fn boxed<F, T>(future: F) -> BoxFuture<'static, T>
where
    F: Future<Output = T> + Send + 'static,
{
    Box::pin(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn test_cancellable_passes_items_until_cancelled() {
        let token = CancellationToken::new();
        let mut s = cancellable(stream::iter(vec![1, 2, 3]), token.clone());
        assert_eq!(s.next().await, Some(1));
        token.cancel();
        assert_eq!(s.next().await, None);
    }

    #[tokio::test]
    async fn test_cancellable_ends_pending_stream() {
        let token = CancellationToken::new();
        let mut s = cancellable(stream::pending::<u8>(), token.clone());
        token.cancel();
        let next = tokio::time::timeout(std::time::Duration::from_millis(100), s.next())
            .await
            .expect("cancelled stream should end promptly");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_boxed_future_resolves() {
        let fut = boxed(async { 7 });
        assert_eq!(fut.await, 7);
    }
}
