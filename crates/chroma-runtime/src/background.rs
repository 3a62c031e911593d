//! Background Bridge Server
//!
//! Receives request envelopes from the host's background slot, dispatches
//! each one through the handler registry on its own task and sends the
//! reply back to the UI context that posted it. Also installs the handlers
//! for the reserved `__chroma/` keys and forwards store commits to every UI
//! context as broadcasts.

use std::sync::Arc;

use anyhow::Context;
use chroma_core::bridge::protocol::{
    Pong, StoreChanged, StoreRequest, StoreSetRequest, StoreSnapshot, PING, STORE_CHANGED,
    STORE_GET, STORE_RESET, STORE_SET,
};
use chroma_core::bridge::{BackgroundPort, Inbound};
use chroma_core::{
    EnvelopeKind, ErasedStore, LocalHost, MessageEnvelope, RegistrationError, StoreHealth,
    StoreRegistry, Subscription,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::registry::{FnHandler, HandlerRegistry};

// ----------------------------------------------------------------------------
// Server Task
// ----------------------------------------------------------------------------

/// Serves bridge requests for one attachment of the background context
pub struct BackgroundServer {
    port: BackgroundPort,
    registry: Arc<HandlerRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundServer {
    pub fn new(
        port: BackgroundPort,
        registry: Arc<HandlerRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            port,
            registry,
            shutdown,
        }
    }

    /// Run until shutdown is signalled or the host suspends the slot
    pub async fn run(mut self) {
        let generation = self.port.generation();
        info!("Background server starting (generation {})", generation);

        loop {
            tokio::select! {
                inbound = self.port.recv() => match inbound {
                    Some(inbound) => self.spawn_dispatch(inbound),
                    None => {
                        info!("Background slot {} suspended by host", generation);
                        break;
                    }
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("Background server shutdown requested");
                        break;
                    }
                }
            }
        }

        info!("Background server stopped (generation {})", generation);
    }

    fn spawn_dispatch(&self, inbound: Inbound) {
        if inbound.envelope.kind != EnvelopeKind::Request {
            trace!(
                "Ignoring {:?} envelope for '{}'",
                inbound.envelope.kind,
                inbound.envelope.key
            );
            return;
        }

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let request = inbound.envelope.clone();
            let outcome = registry
                .dispatch(request.key.as_str(), request.payload.clone())
                .await;
            if inbound.reply(request.reply(&outcome)).await.is_err() {
                debug!(
                    "UI context closed before the reply to '{}' ({})",
                    request.key, request.id
                );
            }
        });
    }
}

// ----------------------------------------------------------------------------
// Reserved Handlers
// ----------------------------------------------------------------------------

fn store_snapshot(store: &dyn ErasedStore) -> anyhow::Result<Value> {
    let snapshot = store.snapshot()?;
    Ok(serde_json::to_value(StoreSnapshot {
        state: snapshot.state,
        ready: store.is_ready(),
        degraded: store.health() == StoreHealth::MemoryOnly,
        epoch: snapshot.epoch,
        version: snapshot.version,
    })?)
}

/// Register the handlers for the reserved keys
pub fn install_builtin_handlers(
    registry: &HandlerRegistry,
    stores: &StoreRegistry,
) -> Result<(), RegistrationError> {
    registry.register_reserved(
        PING,
        Arc::new(FnHandler::new(|_payload: Value| async move {
            Ok::<_, anyhow::Error>(serde_json::to_value(Pong { pong: true })?)
        })),
    )?;

    let get_stores = stores.clone();
    registry.register_reserved(
        STORE_GET,
        Arc::new(FnHandler::new(move |payload: Value| {
            let stores = get_stores.clone();
            async move {
                let request: StoreRequest =
                    serde_json::from_value(payload).context("malformed payload")?;
                let store = stores.get(&request.store)?;
                store_snapshot(store.as_ref())
            }
        })),
    )?;

    let set_stores = stores.clone();
    registry.register_reserved(
        STORE_SET,
        Arc::new(FnHandler::new(move |payload: Value| {
            let stores = set_stores.clone();
            async move {
                let request: StoreSetRequest =
                    serde_json::from_value(payload).context("malformed payload")?;
                let store = stores.get(&request.store)?;
                store.merge(request.partial)?;
                store_snapshot(store.as_ref())
            }
        })),
    )?;

    let reset_stores = stores.clone();
    registry.register_reserved(
        STORE_RESET,
        Arc::new(FnHandler::new(move |payload: Value| {
            let stores = reset_stores.clone();
            async move {
                let request: StoreRequest =
                    serde_json::from_value(payload).context("malformed payload")?;
                let store = stores.get(&request.store)?;
                store.reset();
                store_snapshot(store.as_ref())
            }
        })),
    )?;

    Ok(())
}

/// Broadcast every commit of every registered store to the UI contexts
pub fn forward_store_changes(stores: &StoreRegistry, host: &LocalHost) -> Vec<Subscription> {
    stores
        .all()
        .into_iter()
        .map(|store| {
            let name = store.name().to_string();
            let host = host.clone();
            store.subscribe_json(Box::new(move |snapshot| {
                let change = StoreChanged {
                    store: name.clone(),
                    state: snapshot.state,
                    epoch: snapshot.epoch,
                    version: snapshot.version,
                };
                match serde_json::to_value(change) {
                    Ok(payload) => {
                        let reached =
                            host.broadcast(&MessageEnvelope::broadcast(STORE_CHANGED, payload));
                        trace!("Store '{}' change reached {} UI contexts", name, reached);
                    }
                    Err(e) => debug!("Could not encode change of store '{}': {}", name, e),
                }
            }))
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
