//! Session manager for multiple PTY sessions.
//!
//! This module provides a thread-safe registry that creates, looks up and
//! closes [`PtySession`]s concurrently.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::{SessionId, SessionSpec};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pty::{PtySession, SessionError};
use crate::config::SessionConfig;

/// Information about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID, if known.
    pub pid: Option<u32>,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Whether the process is still running.
    pub running: bool,
    /// Exit code, once the process has exited.
    pub exit_code: Option<i32>,
    /// Number of attached output readers.
    pub readers: usize,
}

impl SessionInfo {
    fn from_session(session: &PtySession) -> Self {
        let (cols, rows) = session.size();
        Self {
            id: session.id().clone(),
            pid: session.pid(),
            cols,
            rows,
            running: session.is_running(),
            exit_code: session.exit_code(),
            readers: session.reader_count(),
        }
    }
}

/// Thread-safe session registry using DashMap.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<PtySession>>,
    config: SessionConfig,
}

impl SessionManager {
    /// Creates an empty manager.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Spawns a new session and returns its id.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create(&self, spec: SessionSpec) -> Result<SessionId, SessionError> {
        let id = Uuid::new_v4().to_string();
        let session = PtySession::spawn(
            id.clone(),
            &spec,
            Some(self.config.default_shell.as_str()),
            self.config.scrollback_bytes,
        )?;
        self.sessions.insert(id.clone(), session);

        tracing::info!(session_id = %id, sessions = self.sessions.len(), "Created new session");
        Ok(id)
    }

    /// Looks up a session.
    pub fn get(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Kills a session's process if still running and removes it.
    pub fn close(&self, session_id: &str) -> Result<(), SessionError> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        match session.kill() {
            Ok(()) | Err(SessionError::AlreadyTerminated(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::info!(session_id = %session_id, "Closed session");
        Ok(())
    }

    /// Lists all sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| SessionInfo::from_session(entry.value()))
            .collect()
    }

    /// Checks if a session exists.
    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Returns the number of sessions, exited ones included until cleanup.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Removes sessions whose process has exited and that nobody is reading.
    ///
    /// Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|id, session| {
            let keep = session.is_running() || session.reader_count() > 0;
            if !keep {
                tracing::info!(session_id = %id, "Cleaned up terminated session");
            }
            keep
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Starts a background task that periodically cleans up exited sessions
    /// until `cancel` fires.
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.cleanup();
                    }
                }
            }
        })
    }

    /// The configuration new sessions are created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
