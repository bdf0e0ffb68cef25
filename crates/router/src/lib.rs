//! # termmux Session Router
//!
//! Multiplexes terminal sessions from a single upstream transport to any
//! number of local viewers.
//!
//! ## Overview
//!
//! - **One stream per session**: however many viewers subscribe to a session,
//!   the transport sees exactly one `attach` and one `on_exit` for it
//! - **Late-joiner replay**: the latest screen snapshot and the exit code are
//!   cached and replayed to viewers that subscribe afterwards
//! - **Exact teardown**: the upstream streams are cancelled the moment the
//!   last viewer of a session leaves
//! - **Router-per-client**: [`RouterLifecycleOwner`] rebuilds the router when
//!   the transport client changes and releases it when the client goes away
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  ┌───────────┐  ┌───────────┐
//! │  viewer   │  │  viewer   │  │  viewer   │
//! └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!       │ subscribe    │              │
//! ┌─────▼──────────────▼──────────────▼─────┐
//! │             SessionRouter               │
//! │   session id → subscribers, snapshot,   │
//! │                exit code, cancel token  │
//! └─────────────────────┬───────────────────┘
//!                       │ attach / on_exit (once per session)
//! ┌─────────────────────▼───────────────────┐
//! │           TerminalTransport             │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use protocol::MemoryTransport;
//! use router::{SessionEvent, SessionRouter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let transport = MemoryTransport::new();
//! let router = SessionRouter::new(Arc::new(transport.clone()));
//!
//! let (_main, mut main_rx) = router.subscribe_channel("s1");
//! let (_popup, mut popup_rx) = router.subscribe_channel("s1");
//! assert_eq!(transport.attach_count("s1"), 1);
//!
//! transport.emit_output("s1", "hello");
//! assert_eq!(main_rx.recv().await, Some(SessionEvent::Output("hello".into())));
//! assert_eq!(popup_rx.recv().await, Some(SessionEvent::Output("hello".into())));
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`router`]: the session router and subscription handles
//! - [`subscriber`]: subscriber callbacks and events
//! - [`lifecycle`]: router-per-client ownership
//! - [`config`]: router tunables
//! - [`error`]: error types

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod router;
pub mod subscriber;

pub use config::RouterConfig;
pub use error::{Result, RouterError};
pub use lifecycle::{LifecycleChange, RouterLifecycleOwner};
pub use router::{SessionRouter, Subscription};
pub use subscriber::{SessionEvent, SubscriberCallbacks, SubscriberId};
