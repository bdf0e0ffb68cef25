//! Terminal session router.
//!
//! The router multiplexes one upstream stream pair per terminal session to any
//! number of local subscribers:
//!
//! - the first `subscribe` for a session id opens the transport's output/state
//!   stream and exit stream; later subscribers attach to the existing session
//!   without touching the transport
//! - the latest full-screen snapshot and the exit code are cached and replayed
//!   to late subscribers on a spawned task, never inline
//! - the unsubscribe that empties a session cancels both streams and removes
//!   the session entry before it returns
//!
//! Each session is consumed by two tasks, one per stream. Both re-check that
//! their own session entry is still in the table before every broadcast, so a
//! torn-down session never receives events from a stream that was already
//! buffering them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use protocol::{
    EventStream, ExitCode, ExitStream, SessionId, SharedTransport, TerminalEvent, TransportError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::subscriber::{next_subscriber_id, SessionEvent, SubscriberCallbacks, SubscriberId};

/// Cached state owed to a subscriber that joined after it was produced.
#[derive(Debug, Default)]
struct Replay {
    screen_state: Option<String>,
    exit_code: Option<ExitCode>,
}

impl Replay {
    fn deliver(self, callbacks: &SubscriberCallbacks) {
        if let Some(state) = self.screen_state {
            callbacks.screen_state(&state);
        }
        if let Some(code) = self.exit_code {
            callbacks.exit(code);
        }
    }
}

struct Subscriber {
    callbacks: SubscriberCallbacks,
    /// Held across every delivery to this subscriber, so the replay and live
    /// events reach it one at a time. The replay it guards is taken exactly
    /// once, by the replay task or by the next broadcast, whichever locks first.
    delivery: Mutex<Option<Replay>>,
}

impl Subscriber {
    fn new(callbacks: SubscriberCallbacks, pending: Option<Replay>) -> Arc<Self> {
        Arc::new(Self {
            callbacks,
            delivery: Mutex::new(pending),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Replay>> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers the owed replay, if any. Returns whether one was delivered.
    fn deliver_pending(&self) -> bool {
        let mut pending = self.lock();
        match pending.take() {
            Some(replay) => {
                replay.deliver(&self.callbacks);
                true
            }
            None => false,
        }
    }

    /// Delivers a live event, preceded by the owed replay if it is still owed.
    fn deliver(&self, event: impl FnOnce(&SubscriberCallbacks)) {
        let mut pending = self.lock();
        if let Some(replay) = pending.take() {
            replay.deliver(&self.callbacks);
        }
        event(&self.callbacks);
    }
}

/// Per-session multiplexing state.
struct SessionEntry {
    /// Distinguishes this entry from later entries under the same id.
    epoch: u64,
    subscribers: HashMap<SubscriberId, Arc<Subscriber>>,
    screen_state: Option<String>,
    /// `Some` once the session has exited.
    exit_code: Option<ExitCode>,
    cancel: CancellationToken,
}

impl SessionEntry {
    fn new(epoch: u64, cancel: CancellationToken) -> Self {
        Self {
            epoch,
            subscribers: HashMap::new(),
            screen_state: None,
            exit_code: None,
            cancel,
        }
    }

    fn targets(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.values().cloned().collect()
    }
}

struct RouterInner {
    transport: SharedTransport,
    config: RouterConfig,
    sessions: DashMap<SessionId, SessionEntry>,
    disposed: AtomicBool,
    next_epoch: AtomicU64,
}

impl RouterInner {
    /// Removes a subscriber, tearing the session down if it was the last one.
    fn release(&self, session_id: &str, subscriber_id: SubscriberId) {
        let now_empty = match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                if entry.subscribers.remove(&subscriber_id).is_none() {
                    return;
                }
                entry.subscribers.is_empty()
            }
            None => return,
        };

        debug!(session_id = %session_id, subscriber_id, "Subscriber removed");

        if !now_empty {
            return;
        }

        // A concurrent subscribe may have joined since the lookup above.
        if let Some((_, entry)) = self
            .sessions
            .remove_if(session_id, |_, entry| entry.subscribers.is_empty())
        {
            entry.cancel.cancel();
            info!(session_id = %session_id, "Last subscriber left, session removed");
        }
    }

    /// Fans a stream event out to the session's subscribers.
    ///
    /// Returns `false` when the session this stream belongs to is gone.
    fn broadcast_event(&self, session_id: &str, epoch: u64, event: &TerminalEvent) -> bool {
        let targets = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return false;
            };
            if entry.epoch != epoch {
                return false;
            }
            if let TerminalEvent::ScreenState(state) = event {
                entry.screen_state = Some(state.clone());
            }
            entry.targets()
        };

        trace!(
            session_id = %session_id,
            subscribers = targets.len(),
            screen_state = event.is_screen_state(),
            "Broadcasting terminal event"
        );

        for subscriber in targets {
            subscriber.deliver(|callbacks| match event {
                TerminalEvent::ScreenState(state) => callbacks.screen_state(state),
                TerminalEvent::Output(data) => callbacks.output(data),
            });
        }
        true
    }

    /// Records the exit code and notifies the session's subscribers.
    fn broadcast_exit(&self, session_id: &str, epoch: u64, code: ExitCode) -> bool {
        let targets = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return false;
            };
            if entry.epoch != epoch {
                return false;
            }
            entry.exit_code = Some(code);
            entry.targets()
        };

        info!(
            session_id = %session_id,
            exit_code = code,
            subscribers = targets.len(),
            "Session exited"
        );

        for subscriber in targets {
            subscriber.deliver(|callbacks| callbacks.exit(code));
        }
        true
    }

    /// Delivers the cached state owed to a late subscriber, if still owed.
    fn replay(&self, session_id: &str, subscriber_id: SubscriberId) {
        let subscriber = {
            let Some(entry) = self.sessions.get(session_id) else {
                return;
            };
            let Some(subscriber) = entry.subscribers.get(&subscriber_id) else {
                return;
            };
            Arc::clone(subscriber)
        };

        if subscriber.deliver_pending() {
            debug!(session_id = %session_id, subscriber_id, "Replayed cached session state");
        }
    }

    /// Cancels every session and clears the table. Returns how many were cancelled.
    fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        self.sessions.retain(|_, entry| {
            entry.cancel.cancel();
            cancelled += 1;
            false
        });
        cancelled
    }
}

impl Drop for RouterInner {
    fn drop(&mut self) {
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
        }
    }
}

/// Multiplexes terminal sessions from one transport to many local viewers.
///
/// Cloning is cheap and yields another handle to the same router.
///
/// Methods that start background work (`subscribe`, `send_input`) must be
/// called from within a Tokio runtime.
#[derive(Clone)]
pub struct SessionRouter {
    inner: Arc<RouterInner>,
}

impl SessionRouter {
    /// Creates a router bound to `transport` with the default configuration.
    pub fn new(transport: SharedTransport) -> Self {
        Self::with_config(transport, RouterConfig::default())
    }

    /// Creates a router bound to `transport`.
    pub fn with_config(transport: SharedTransport, config: RouterConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                transport,
                config,
                sessions: DashMap::new(),
                disposed: AtomicBool::new(false),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the transport this router is bound to.
    pub fn transport(&self) -> &SharedTransport {
        &self.inner.transport
    }

    /// Registers a viewer for a session.
    ///
    /// Starts the session's upstream streams if this is its first subscriber.
    /// Cached screen state and exit code are delivered on a spawned task, so
    /// no callback runs before this returns.
    pub fn subscribe(&self, session_id: &str, callbacks: SubscriberCallbacks) -> Subscription {
        let subscriber_id = next_subscriber_id();

        let (started, owes_replay) = match self.inner.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let replay = Replay {
                    screen_state: entry.screen_state.clone(),
                    exit_code: entry.exit_code,
                };
                let owes_replay = replay.screen_state.is_some() || replay.exit_code.is_some();
                entry.subscribers.insert(
                    subscriber_id,
                    Subscriber::new(callbacks, owes_replay.then_some(replay)),
                );
                (None, owes_replay)
            }
            Entry::Vacant(vacant) => {
                let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                let mut entry = SessionEntry::new(epoch, cancel.clone());
                entry
                    .subscribers
                    .insert(subscriber_id, Subscriber::new(callbacks, None));
                vacant.insert(entry);
                (Some((epoch, cancel)), false)
            }
        };

        // Checked after the insert so a concurrent dispose either sees the
        // entry or is seen here.
        if self.inner.disposed.load(Ordering::SeqCst) {
            debug!(session_id = %session_id, "Subscribe on a disposed router ignored");
            self.inner.release(session_id, subscriber_id);
            return Subscription::inert(session_id, subscriber_id);
        }

        debug!(session_id = %session_id, subscriber_id, "Subscriber added");

        if let Some((epoch, cancel)) = started {
            self.start_streams(session_id, epoch, cancel);
        }

        if owes_replay {
            let inner = Arc::downgrade(&self.inner);
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Some(inner) = inner.upgrade() {
                    inner.replay(&session_id, subscriber_id);
                }
            });
        }

        Subscription {
            router: Arc::downgrade(&self.inner),
            session_id: session_id.to_string(),
            id: subscriber_id,
            active: AtomicBool::new(true),
        }
    }

    /// Subscribes with a channel instead of callbacks.
    pub fn subscribe_channel(
        &self,
        session_id: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(session_id, SubscriberCallbacks::from_channel(tx));
        (subscription, rx)
    }

    /// Forwards input to the session, fire-and-forget.
    ///
    /// Works whether or not the session currently has subscribers. Failures
    /// are logged, never returned.
    pub fn send_input(&self, session_id: &str, data: &str) {
        if self.is_disposed() {
            debug!(session_id = %session_id, "Input dropped, router disposed");
            return;
        }

        let pending = self.inner.transport.send_input(session_id, data);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = pending.await {
                warn!(session_id = %session_id, error = %e, "Failed to send input");
            }
        });
    }

    /// Resizes the session's terminal and waits for the transport to confirm.
    ///
    /// Allowed whether or not the session currently has subscribers.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        if self.is_disposed() {
            return Err(RouterError::Disposed);
        }
        self.inner
            .transport
            .resize(session_id, cols, rows)
            .await
            .map_err(RouterError::from)
    }

    /// Cancels every session's upstream streams and clears all state.
    ///
    /// Safe to call more than once.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            debug!("Session router already disposed");
            return;
        }
        let cancelled = self.inner.cancel_all();
        info!(sessions = cancelled, "Session router disposed");
    }

    /// Returns whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Returns whether the session has at least one subscriber.
    pub fn has_subscribers(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .get(session_id)
            .is_some_and(|entry| !entry.subscribers.is_empty())
    }

    /// Number of subscribers currently attached to a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    /// Number of sessions with an active upstream stream pair.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    fn start_streams(&self, session_id: &str, epoch: u64, cancel: CancellationToken) {
        // A dispose racing the subscribe may already have cancelled the entry.
        if cancel.is_cancelled() {
            debug!(session_id = %session_id, "Session cancelled before its streams started");
            return;
        }

        info!(session_id = %session_id, "Starting upstream streams");

        let events = self.inner.transport.attach(session_id, cancel.clone());
        let exits = self.inner.transport.on_exit(session_id, cancel.clone());

        tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            session_id.to_string(),
            epoch,
            cancel.clone(),
            events,
        ));
        tokio::spawn(pump_exit(
            Arc::downgrade(&self.inner),
            session_id.to_string(),
            epoch,
            cancel,
            exits,
        ));
    }
}

impl fmt::Debug for SessionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRouter")
            .field("sessions", &self.inner.sessions.len())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Consumes a session's output/state stream.
async fn pump_events(
    router: Weak<RouterInner>,
    session_id: SessionId,
    epoch: u64,
    cancel: CancellationToken,
    mut events: EventStream,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                let Some(inner) = router.upgrade() else { break };
                if cancel.is_cancelled() || !inner.broadcast_event(&session_id, epoch, &event) {
                    break;
                }
            }
            Some(Err(e)) => {
                report_stream_error(&session_id, "output", &cancel, &e, false);
                break;
            }
            None => {
                debug!(session_id = %session_id, "Output stream ended");
                break;
            }
        }
    }
    trace!(session_id = %session_id, "Output pump stopped");
}

/// Consumes a session's exit stream. Only the first exit code is used.
async fn pump_exit(
    router: Weak<RouterInner>,
    session_id: SessionId,
    epoch: u64,
    cancel: CancellationToken,
    mut exits: ExitStream,
) {
    let next = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        next = exits.next() => next,
    };

    match next {
        Some(Ok(code)) => {
            if let Some(inner) = router.upgrade() {
                if !cancel.is_cancelled() {
                    inner.broadcast_exit(&session_id, epoch, code);
                }
            }
        }
        Some(Err(e)) => {
            let benign = router
                .upgrade()
                .is_some_and(|inner| inner.config.is_benign_exit_error(&e));
            report_stream_error(&session_id, "exit", &cancel, &e, benign);
        }
        None => debug!(session_id = %session_id, "Exit stream ended without a code"),
    }
}

fn report_stream_error(
    session_id: &str,
    stream: &'static str,
    cancel: &CancellationToken,
    error: &TransportError,
    benign: bool,
) {
    if cancel.is_cancelled() || error.is_cancelled() {
        debug!(session_id = %session_id, stream, "Stream stopped by cancellation");
    } else if benign {
        debug!(session_id = %session_id, stream, error = %error, "Session already gone upstream");
    } else {
        warn!(session_id = %session_id, stream, error = %error, "Upstream stream failed");
    }
}

/// A viewer's registration with a [`SessionRouter`].
///
/// Dropping the subscription unsubscribes. The handle holds no strong
/// reference to the router, so it never keeps a disposed router alive.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    router: Weak<RouterInner>,
    session_id: SessionId,
    id: SubscriberId,
    active: AtomicBool,
}

impl Subscription {
    fn inert(session_id: &str, id: SubscriberId) -> Self {
        Self {
            router: Weak::new(),
            session_id: session_id.to_string(),
            id,
            active: AtomicBool::new(false),
        }
    }

    /// Removes this subscriber from its session.
    ///
    /// Idempotent, and a no-op when the session is already gone.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.router.upgrade() {
            inner.release(&self.session_id, self.id);
        }
    }

    /// The subscriber handle allocated for this registration.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The session this subscription belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns false once `unsubscribe` has been called or the router refused
    /// the subscription.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("session_id", &self.session_id)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
