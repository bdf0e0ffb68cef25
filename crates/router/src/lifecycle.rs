//! Router-per-client ownership.
//!
//! [`RouterLifecycleOwner`] keeps exactly one [`SessionRouter`] bound to the
//! current transport client. A new client identity (after a reconnect, say)
//! disposes the old router and builds a fresh one; losing the client disposes
//! the router and publishes `None`, leaving viewers to keep rendering what
//! they already have.

use std::sync::Arc;

use protocol::SharedTransport;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RouterConfig;
use crate::router::SessionRouter;

/// What a call to [`RouterLifecycleOwner::evaluate`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleChange {
    /// The bound router (or the absence of one) still matches the client.
    Unchanged,
    /// A router was built where there was none.
    Created,
    /// The client changed identity; the old router was disposed and replaced.
    Replaced,
    /// The client went away; the router was disposed.
    Released,
}

struct BoundRouter {
    client: SharedTransport,
    router: SessionRouter,
}

/// Owns the router bound to the current transport client.
pub struct RouterLifecycleOwner {
    config: RouterConfig,
    current: Option<BoundRouter>,
    router_tx: watch::Sender<Option<SessionRouter>>,
    generation: u64,
}

/// Compares client identity by allocation, ignoring vtable pointers.
fn same_client(a: &SharedTransport, b: &SharedTransport) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl RouterLifecycleOwner {
    pub fn new(config: RouterConfig) -> Self {
        let (router_tx, _) = watch::channel(None);
        Self {
            config,
            current: None,
            router_tx,
            generation: 0,
        }
    }

    /// Reconciles the bound router with the current client.
    pub fn evaluate(&mut self, client: Option<&SharedTransport>) -> LifecycleChange {
        let Some(client) = client else {
            if self.current.is_none() {
                return LifecycleChange::Unchanged;
            }
            self.release();
            info!("Transport client lost, router released");
            return LifecycleChange::Released;
        };

        if self
            .current
            .as_ref()
            .is_some_and(|bound| same_client(client, &bound.client))
        {
            return LifecycleChange::Unchanged;
        }

        let replacing = self.current.is_some();
        if let Some(old) = self.current.take() {
            old.router.dispose();
        }
        let router = SessionRouter::with_config(Arc::clone(client), self.config.clone());
        self.current = Some(BoundRouter {
            client: Arc::clone(client),
            router: router.clone(),
        });
        self.generation += 1;
        self.router_tx.send_replace(Some(router));

        if replacing {
            info!(generation = self.generation, "Transport client changed, router rebuilt");
            LifecycleChange::Replaced
        } else {
            info!(generation = self.generation, "Session router created");
            LifecycleChange::Created
        }
    }

    /// The router bound to the current client, if any.
    pub fn router(&self) -> Option<SessionRouter> {
        self.current.as_ref().map(|bound| bound.router.clone())
    }

    /// Subscribes to router changes. The receiver always sees the latest
    /// router, or `None` while no client is available.
    pub fn watch(&self) -> watch::Receiver<Option<SessionRouter>> {
        self.router_tx.subscribe()
    }

    /// Number of routers built so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Disposes the current router unconditionally. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.current.is_some() {
            self.release();
            debug!("Router lifecycle owner shut down");
        }
    }

    /// Follows `clients` until `shutdown` fires or the client sender is
    /// dropped, then disposes the router.
    pub async fn run(
        mut self,
        mut clients: watch::Receiver<Option<SharedTransport>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let client = clients.borrow_and_update().clone();
            self.evaluate(client.as_ref());

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                changed = clients.changed() => {
                    if changed.is_err() {
                        debug!("Client source closed");
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }

    fn release(&mut self) {
        if let Some(old) = self.current.take() {
            old.router.dispose();
        }
        self.router_tx.send_replace(None);
    }
}

impl Drop for RouterLifecycleOwner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
