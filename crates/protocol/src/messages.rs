//! Terminal message definitions shared by transports and the router.
//!
//! Events are serialized as `{"type": ..., "data": ...}` objects so that a
//! JSON-speaking transport can forward them without re-shaping.

use serde::{Deserialize, Serialize};

/// Identifier of a terminal session, assigned by the transport.
pub type SessionId = String;

/// Exit code reported when a session's process terminates.
pub type ExitCode = i32;

/// Default terminal width used when a caller does not specify one.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height used when a caller does not specify one.
pub const DEFAULT_ROWS: u16 = 24;

/// An event produced by a session's output/state stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum TerminalEvent {
    /// Full-screen snapshot, sufficient to redraw a view from scratch.
    ScreenState(String),
    /// Incremental output since the previous event.
    Output(String),
}

impl TerminalEvent {
    /// Returns the payload carried by the event.
    pub fn data(&self) -> &str {
        match self {
            TerminalEvent::ScreenState(data) | TerminalEvent::Output(data) => data,
        }
    }

    /// Returns true for full-screen snapshots.
    pub fn is_screen_state(&self) -> bool {
        matches!(self, TerminalEvent::ScreenState(_))
    }
}

/// Request to create a new terminal session on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Requested terminal columns.
    pub cols: u16,
    /// Requested terminal rows.
    pub rows: u16,
    /// Program to run. `None` means the host's default shell.
    pub command: Option<String>,
    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Working directory for the session.
    pub cwd: Option<String>,
}

impl Default for SessionSpec {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            command: None,
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }
}

impl SessionSpec {
    /// Sets the program and its arguments.
    pub fn command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some(program.into());
        self.args = args;
        self
    }

    /// Sets the initial terminal size.
    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}
