//! # termmux Protocol Library
//!
//! Shared vocabulary between terminal hosts and the viewers that multiplex
//! their sessions.
//!
//! ## Overview
//!
//! - **Messages**: session identifiers, exit codes and the tagged
//!   [`TerminalEvent`] carried on a session's output stream
//! - **Transport**: the [`TerminalTransport`] trait every host backend
//!   implements (`attach`, `on_exit`, `send_input`, `resize`, `close`)
//! - **Memory transport**: a scripted in-process [`MemoryTransport`]
//! - **Errors**: [`TransportError`] and the crate [`Result`] alias
//!
//! ## Example Usage
//!
//! ```rust
//! use futures_util::StreamExt;
//! use protocol::{MemoryTransport, TerminalEvent, TerminalTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let transport = MemoryTransport::new();
//! let mut events = transport.attach("s1", CancellationToken::new());
//!
//! transport.emit_screen_state("s1", "$ ");
//! let event = events.next().await.unwrap().unwrap();
//! assert_eq!(event, TerminalEvent::ScreenState("$ ".to_string()));
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: session and event definitions
//! - [`transport`]: the upstream transport contract
//! - [`memory`]: in-memory transport
//! - [`error`]: error types

pub mod error;
pub mod memory;
pub mod messages;
pub mod transport;

pub use error::{Result, TransportError};
pub use memory::MemoryTransport;
pub use messages::{ExitCode, SessionId, SessionSpec, TerminalEvent, DEFAULT_COLS, DEFAULT_ROWS};
pub use transport::{
    boxed, cancellable, EventStream, ExitStream, SharedTransport, TerminalTransport,
};
