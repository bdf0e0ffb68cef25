//! Subscriber registrations.
//!
//! A subscriber is one viewer of a session. The router stores each one as a
//! [`SubscriberCallbacks`] value keyed by a process-unique [`SubscriberId`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use protocol::ExitCode;
use tokio::sync::mpsc;

/// Handle identifying one subscriber registration.
pub type SubscriberId = u64;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a subscriber id. Ids increase monotonically and are never reused
/// for the lifetime of the process.
pub(crate) fn next_subscriber_id() -> SubscriberId {
    NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed)
}

type TextCallback = Arc<dyn Fn(&str) + Send + Sync>;
type ExitCallback = Arc<dyn Fn(ExitCode) + Send + Sync>;

/// An event delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Full-screen snapshot, either live or replayed from the cache.
    ScreenState(String),
    /// Incremental output.
    Output(String),
    /// The session's process exited with this code.
    Exit(ExitCode),
}

/// The three callbacks a viewer registers with the router.
///
/// Unset callbacks are no-ops, so a viewer only interested in output can
/// build one with `SubscriberCallbacks::new().on_output(...)`.
#[derive(Clone)]
pub struct SubscriberCallbacks {
    on_output: TextCallback,
    on_screen_state: TextCallback,
    on_exit: ExitCallback,
}

impl SubscriberCallbacks {
    /// Creates callbacks that ignore every event.
    pub fn new() -> Self {
        Self {
            on_output: Arc::new(|_| {}),
            on_screen_state: Arc::new(|_| {}),
            on_exit: Arc::new(|_| {}),
        }
    }

    /// Sets the incremental output callback.
    pub fn on_output(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_output = Arc::new(f);
        self
    }

    /// Sets the screen snapshot callback.
    pub fn on_screen_state(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_screen_state = Arc::new(f);
        self
    }

    /// Sets the exit callback.
    pub fn on_exit(mut self, f: impl Fn(ExitCode) + Send + Sync + 'static) -> Self {
        self.on_exit = Arc::new(f);
        self
    }

    /// Routes every event into an unbounded channel.
    ///
    /// Events sent after the receiver is dropped are discarded.
    pub fn from_channel(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let output_tx = tx.clone();
        let state_tx = tx.clone();
        Self::new()
            .on_output(move |data| {
                let _ = output_tx.send(SessionEvent::Output(data.to_string()));
            })
            .on_screen_state(move |state| {
                let _ = state_tx.send(SessionEvent::ScreenState(state.to_string()));
            })
            .on_exit(move |code| {
                let _ = tx.send(SessionEvent::Exit(code));
            })
    }

    pub(crate) fn output(&self, data: &str) {
        (self.on_output)(data)
    }

    pub(crate) fn screen_state(&self, state: &str) {
        (self.on_screen_state)(state)
    }

    pub(crate) fn exit(&self, code: ExitCode) {
        (self.on_exit)(code)
    }
}

impl Default for SubscriberCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriberCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberCallbacks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subscriber_ids_increase() {
        let a = next_subscriber_id();
        let b = next_subscriber_id();
        let c = next_subscriber_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_default_callbacks_are_noops() {
        let callbacks = SubscriberCallbacks::default();
        callbacks.output("x");
        callbacks.screen_state("y");
        callbacks.exit(1);
    }

    #[test]
    fn test_builder_routes_each_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (seen.clone(), seen.clone(), seen.clone());
        let callbacks = SubscriberCallbacks::new()
            .on_output(move |d| a.lock().unwrap().push(format!("out:{d}")))
            .on_screen_state(move |s| b.lock().unwrap().push(format!("state:{s}")))
            .on_exit(move |code| c.lock().unwrap().push(format!("exit:{code}")));

        callbacks.screen_state("$ ");
        callbacks.output("ls\n");
        callbacks.exit(0);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["state:$ ", "out:ls\n", "exit:0"]
        );
    }

    #[tokio::test]
    async fn test_from_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callbacks = SubscriberCallbacks::from_channel(tx);

        callbacks.output("hello");
        callbacks.exit(2);

        assert_eq!(rx.recv().await, Some(SessionEvent::Output("hello".to_string())));
        assert_eq!(rx.recv().await, Some(SessionEvent::Exit(2)));
    }

    #[test]
    fn test_from_channel_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let callbacks = SubscriberCallbacks::from_channel(tx);
        // Must not panic.
        callbacks.output("lost");
    }
}
