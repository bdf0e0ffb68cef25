//! Local PTY transport.
//!
//! [`LocalTransport`] serves sessions owned by a [`SessionManager`] in this
//! process through the [`TerminalTransport`] contract, so a router can be
//! pointed at local shells exactly as it would at a remote host.

use std::sync::{Arc, Weak};

use futures_util::future::{self, BoxFuture};
use futures_util::stream::{self, StreamExt};
use protocol::{
    boxed, cancellable, EventStream, ExitStream, Result, TerminalEvent, TerminalTransport,
    TransportError,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::session::{PtySession, SessionManager};

/// Transport backed by in-process PTY sessions.
#[derive(Clone)]
pub struct LocalTransport {
    manager: Arc<SessionManager>,
}

impl LocalTransport {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// The manager whose sessions this transport serves.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    fn session(&self, session_id: &str) -> Result<Arc<PtySession>> {
        self.manager
            .get(session_id)
            .ok_or_else(|| TransportError::not_found(session_id))
    }
}

/// State threaded through the output stream.
struct OutputCursor {
    session: Weak<PtySession>,
    rx: broadcast::Receiver<String>,
}

/// Yields the next delta, or a fresh snapshot when the receiver fell behind.
async fn next_output(mut cursor: OutputCursor) -> Option<(Result<TerminalEvent>, OutputCursor)> {
    match cursor.rx.recv().await {
        Ok(data) => Some((Ok(TerminalEvent::Output(data)), cursor)),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            let session = cursor.session.upgrade()?;
            tracing::warn!(
                session_id = %session.id(),
                skipped,
                "Output reader lagged, resyncing with screen state"
            );
            let (snapshot, rx) = session.attach();
            cursor.rx = rx;
            Some((Ok(TerminalEvent::ScreenState(snapshot)), cursor))
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

fn failed<T: Send + 'static>(error: TransportError) -> stream::BoxStream<'static, Result<T>> {
    stream::once(future::ready(Err(error))).boxed()
}

impl TerminalTransport for LocalTransport {
    fn attach(&self, session_id: &str, cancel: CancellationToken) -> EventStream {
        let session = match self.session(session_id) {
            Ok(session) => session,
            Err(e) => return failed(e),
        };

        let (snapshot, rx) = session.attach();
        let cursor = OutputCursor {
            session: Arc::downgrade(&session),
            rx,
        };

        tracing::debug!(session_id = %session_id, "Local attach");

        let events = stream::once(future::ready(Ok(TerminalEvent::ScreenState(snapshot))))
            .chain(stream::unfold(cursor, next_output));
        cancellable(events, cancel)
    }

    fn on_exit(&self, session_id: &str, cancel: CancellationToken) -> ExitStream {
        let session = match self.session(session_id) {
            Ok(session) => session,
            Err(e) => return failed(e),
        };

        let mut exit = session.exit_watch();
        let code = async move {
            match exit.wait_for(Option::is_some).await.map(|code| *code) {
                Ok(code) => code.ok_or_else(|| {
                    TransportError::ConnectionClosed("exit status unavailable".to_string())
                }),
                Err(_) => Err(TransportError::ConnectionClosed(
                    "session dropped before exit".to_string(),
                )),
            }
        };
        cancellable(stream::once(code), cancel)
    }

    fn send_input(&self, session_id: &str, data: &str) -> BoxFuture<'static, Result<()>> {
        let session = self.session(session_id);
        let data = data.to_string();
        boxed(async move {
            session?
                .write(data.as_bytes())
                .await
                .map_err(TransportError::from)
        })
    }

    fn resize(&self, session_id: &str, cols: u16, rows: u16) -> BoxFuture<'static, Result<()>> {
        let session = self.session(session_id);
        boxed(async move {
            session?
                .resize(cols, rows)
                .await
                .map_err(TransportError::from)
        })
    }

    fn close(&self, session_id: &str) -> BoxFuture<'static, Result<()>> {
        let result = self.manager.close(session_id).map_err(TransportError::from);
        boxed(future::ready(result))
    }
}
