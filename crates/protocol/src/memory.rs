//! In-process scripted transport.
//!
//! [`MemoryTransport`] implements [`TerminalTransport`] without any host
//! behind it. The owner pushes events into attached streams with
//! [`emit`](MemoryTransport::emit) and [`exit`](MemoryTransport::exit), and
//! every call the transport receives is recorded for later inspection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};
use crate::messages::{ExitCode, SessionId, TerminalEvent};
use crate::transport::{boxed, cancellable, EventStream, ExitStream, TerminalTransport};

type EventSender = mpsc::UnboundedSender<Result<TerminalEvent>>;
type ExitSender = mpsc::UnboundedSender<Result<ExitCode>>;

#[derive(Default)]
struct MemoryState {
    event_txs: HashMap<SessionId, Vec<EventSender>>,
    exit_txs: HashMap<SessionId, Vec<ExitSender>>,
    attach_calls: HashMap<SessionId, usize>,
    exit_calls: HashMap<SessionId, usize>,
    inputs: Vec<(SessionId, String)>,
    resizes: Vec<(SessionId, u16, u16)>,
    closed: Vec<SessionId>,
    resize_error: Option<TransportError>,
}

/// A scripted, in-memory terminal transport.
///
/// Cloning yields another handle to the same state.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers an event to every open output stream of a session.
    ///
    /// Returns the number of streams that received it.
    pub fn emit(&self, session_id: &str, event: TerminalEvent) -> usize {
        let mut state = self.lock();
        let Some(senders) = state.event_txs.get_mut(session_id) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders
            .iter()
            .filter(|tx| tx.send(Ok(event.clone())).is_ok())
            .count()
    }

    /// Shorthand for emitting [`TerminalEvent::Output`].
    pub fn emit_output(&self, session_id: &str, data: &str) -> usize {
        self.emit(session_id, TerminalEvent::Output(data.to_string()))
    }

    /// Shorthand for emitting [`TerminalEvent::ScreenState`].
    pub fn emit_screen_state(&self, session_id: &str, data: &str) -> usize {
        self.emit(session_id, TerminalEvent::ScreenState(data.to_string()))
    }

    /// Reports the session's exit code and ends its open exit streams.
    pub fn exit(&self, session_id: &str, code: ExitCode) -> usize {
        let senders = self.lock().exit_txs.remove(session_id).unwrap_or_default();
        senders.iter().filter(|tx| tx.send(Ok(code)).is_ok()).count()
    }

    /// Fails every open output stream of a session with `error`.
    pub fn fail_attach(&self, session_id: &str, error: TransportError) -> usize {
        let senders = self.lock().event_txs.remove(session_id).unwrap_or_default();
        senders
            .iter()
            .filter(|tx| tx.send(Err(error.clone())).is_ok())
            .count()
    }

    /// Fails every open exit stream of a session with `error`.
    pub fn fail_exit(&self, session_id: &str, error: TransportError) -> usize {
        let senders = self.lock().exit_txs.remove(session_id).unwrap_or_default();
        senders
            .iter()
            .filter(|tx| tx.send(Err(error.clone())).is_ok())
            .count()
    }

    /// Makes subsequent resize calls fail with `error`, or succeed again with `None`.
    pub fn fail_resize(&self, error: Option<TransportError>) {
        self.lock().resize_error = error;
    }

    /// Number of `attach` calls received for a session.
    pub fn attach_count(&self, session_id: &str) -> usize {
        self.lock().attach_calls.get(session_id).copied().unwrap_or(0)
    }

    /// Number of `on_exit` calls received for a session.
    pub fn exit_count(&self, session_id: &str) -> usize {
        self.lock().exit_calls.get(session_id).copied().unwrap_or(0)
    }

    /// Number of output streams of a session that are still being consumed.
    pub fn open_streams(&self, session_id: &str) -> usize {
        self.lock()
            .event_txs
            .get(session_id)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Input received so far, in call order.
    pub fn inputs(&self) -> Vec<(SessionId, String)> {
        self.lock().inputs.clone()
    }

    /// Resize requests received so far, in call order.
    pub fn resizes(&self) -> Vec<(SessionId, u16, u16)> {
        self.lock().resizes.clone()
    }

    /// Sessions closed so far, in call order.
    pub fn closed(&self) -> Vec<SessionId> {
        self.lock().closed.clone()
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

impl TerminalTransport for MemoryTransport {
    fn attach(&self, session_id: &str, cancel: CancellationToken) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            *state.attach_calls.entry(session_id.to_string()).or_default() += 1;
            state
                .event_txs
                .entry(session_id.to_string())
                .or_default()
                .push(tx);
        }
        cancellable(receiver_stream(rx), cancel)
    }

    fn on_exit(&self, session_id: &str, cancel: CancellationToken) -> ExitStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            *state.exit_calls.entry(session_id.to_string()).or_default() += 1;
            state
                .exit_txs
                .entry(session_id.to_string())
                .or_default()
                .push(tx);
        }
        cancellable(receiver_stream(rx), cancel)
    }

    fn send_input(&self, session_id: &str, data: &str) -> BoxFuture<'static, Result<()>> {
        self.lock()
            .inputs
            .push((session_id.to_string(), data.to_string()));
        boxed(async { Ok(()) })
    }

    fn resize(&self, session_id: &str, cols: u16, rows: u16) -> BoxFuture<'static, Result<()>> {
        let mut state = self.lock();
        let result = match state.resize_error.clone() {
            Some(err) => Err(err),
            None => {
                state.resizes.push((session_id.to_string(), cols, rows));
                Ok(())
            }
        };
        boxed(async move { result })
    }

    fn close(&self, session_id: &str) -> BoxFuture<'static, Result<()>> {
        let mut state = self.lock();
        state.closed.push(session_id.to_string());
        state.event_txs.remove(session_id);
        state.exit_txs.remove(session_id);
        boxed(async { Ok(()) })
    }
}
