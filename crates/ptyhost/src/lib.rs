//! # termmux PTY Host
//!
//! Local terminal backend for the termmux session router.
//!
//! ## Overview
//!
//! - **PTY sessions**: spawn shells or commands with `portable-pty`, keep a
//!   bounded scrollback and broadcast decoded output
//! - **Session manager**: a concurrent registry of live sessions
//! - **Local transport**: [`LocalTransport`] exposes the manager through the
//!   `TerminalTransport` contract consumed by the router
//! - **Configuration and logging**: TOML configuration and file-based tracing
//!   for the `termmux` binary
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use protocol::SessionSpec;
//! use ptyhost::{Config, LocalTransport, SessionManager};
//! use router::{SessionRouter, SubscriberCallbacks};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let manager = Arc::new(SessionManager::new(config.session.clone()));
//!     let session_id = manager.create(SessionSpec::default())?;
//!
//!     let router = SessionRouter::new(Arc::new(LocalTransport::new(manager)));
//!     let _view = router.subscribe(
//!         &session_id,
//!         SubscriberCallbacks::new().on_output(|data| print!("{data}")),
//!     );
//!     router.send_input(&session_id, "echo hello\n");
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: PTY sessions and the session manager
//! - [`transport`]: the local transport
//! - [`config`]: configuration management
//! - [`logging`]: tracing setup

pub mod config;
pub mod logging;
pub mod session;
pub mod transport;

pub use config::{Config, ConfigError};
pub use session::{PtySession, SessionError, SessionInfo, SessionManager};
pub use transport::LocalTransport;
