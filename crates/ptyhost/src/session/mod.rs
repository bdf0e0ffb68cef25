//! Session management module.
//!
//! This module provides PTY spawning and session lifecycle management.
//! Sessions can be created, attached to, written to, resized, and closed.

pub mod buffer;
pub mod manager;
pub mod pty;

pub use buffer::{Scrollback, Utf8Decoder};
pub use manager::{SessionInfo, SessionManager};
pub use pty::{detect_shell, PtySession, SessionError};
