//! Host Messaging Primitive
//!
//! The host process model hands the bridge a connectionless, best-effort
//! primitive: a UI context can post to the background context, and posting
//! fails when the background is not currently alive. `LocalHost` implements
//! that primitive in process with tokio channels:
//!
//! - one background slot that can be attached, suspended and re-attached
//! - any number of UI ports, each with its own inbox for replies and
//!   broadcasts
//!
//! Requests reach the background as `Inbound` values carrying a reply
//! channel back to the posting UI port.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::BridgeConfig;
use crate::envelope::MessageEnvelope;

// ----------------------------------------------------------------------------
// Port Errors
// ----------------------------------------------------------------------------

/// Failure to hand an envelope to the receiving context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("Receiving context is not alive")]
    ReceiverUnavailable,
    #[error("Inbox of the receiving context is full")]
    InboxFull,
}

// ----------------------------------------------------------------------------
// Port Trait
// ----------------------------------------------------------------------------

/// Outbound side of a UI context
#[async_trait]
pub trait Port: Send + Sync {
    /// Hand a request envelope to the background context
    async fn post(&self, envelope: MessageEnvelope) -> Result<(), PortError>;
}

// ----------------------------------------------------------------------------
// Inbound Requests
// ----------------------------------------------------------------------------

/// A request as received by the background context
#[derive(Debug)]
pub struct Inbound {
    pub envelope: MessageEnvelope,
    reply_to: mpsc::Sender<MessageEnvelope>,
}

impl Inbound {
    /// Send the reply to the UI port that posted the request
    pub async fn reply(self, envelope: MessageEnvelope) -> Result<(), PortError> {
        self.reply_to
            .send(envelope)
            .await
            .map_err(|_| PortError::ReceiverUnavailable)
    }
}

/// Receiving side of the background slot
#[derive(Debug)]
pub struct BackgroundPort {
    generation: u64,
    rx: mpsc::Receiver<Inbound>,
}

impl BackgroundPort {
    /// Receive the next request, `None` once the slot has been suspended
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    /// Attachment generation, increasing with every `attach_background`
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ----------------------------------------------------------------------------
// Local Host
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct BackgroundSlot {
    generation: u64,
    tx: mpsc::Sender<Inbound>,
}

#[derive(Debug)]
struct HostInner {
    background: RwLock<Option<BackgroundSlot>>,
    generations: AtomicU64,
    ui_ports: DashMap<u64, mpsc::Sender<MessageEnvelope>>,
    next_port: AtomicU64,
    buffer_size: usize,
}

/// In-process host connecting one background context to UI contexts
#[derive(Debug, Clone)]
pub struct LocalHost {
    inner: Arc<HostInner>,
}

impl LocalHost {
    /// Create a host whose channels hold `buffer_size` envelopes
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(HostInner {
                background: RwLock::new(None),
                generations: AtomicU64::new(0),
                ui_ports: DashMap::new(),
                next_port: AtomicU64::new(0),
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    /// Create a host sized by the bridge configuration
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.inbox_buffer_size)
    }

    /// Attach a (new) background context, replacing any previous one
    pub fn attach_background(&self) -> BackgroundPort {
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.inner.buffer_size);
        *self.slot_mut() = Some(BackgroundSlot { generation, tx });
        debug!("Background context attached (generation {})", generation);
        BackgroundPort { generation, rx }
    }

    /// Suspend the background context; posts fail until it is re-attached
    pub fn suspend_background(&self) {
        if self.slot_mut().take().is_some() {
            debug!("Background context suspended");
        }
    }

    /// Detach the background of `generation` if it is still attached
    pub fn detach(&self, generation: u64) {
        let mut slot = self.slot_mut();
        if slot
            .as_ref()
            .is_some_and(|current| current.generation == generation)
        {
            *slot = None;
            debug!("Background context detached (generation {})", generation);
        }
    }

    pub fn is_background_attached(&self) -> bool {
        self.inner
            .background
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Open a new UI context
    pub fn connect_ui(&self) -> UiConnection {
        let id = self.inner.next_port.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.inner.buffer_size);
        self.inner.ui_ports.insert(id, tx.clone());
        debug!("UI context {} connected", id);
        UiConnection {
            port: UiPort {
                id,
                host: self.clone(),
                inbox: tx,
            },
            inbox: rx,
        }
    }

    /// Number of UI contexts whose inbox is still open
    pub fn ui_count(&self) -> usize {
        self.prune();
        self.inner.ui_ports.len()
    }

    /// Deliver a one-way envelope to every live UI context
    ///
    /// Delivery is best-effort: a full inbox drops the envelope for that
    /// context only. Returns the number of contexts reached.
    pub fn broadcast(&self, envelope: &MessageEnvelope) -> usize {
        self.prune();
        let mut delivered = 0;
        for port in self.inner.ui_ports.iter() {
            match port.value().try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => trace!("Broadcast to UI context {} dropped: {}", port.key(), e),
            }
        }
        delivered
    }

    fn prune(&self) {
        self.inner.ui_ports.retain(|_, tx| !tx.is_closed());
    }

    fn background_sender(&self) -> Option<mpsc::Sender<Inbound>> {
        self.inner
            .background
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|slot| slot.tx.clone())
    }

    fn slot_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<BackgroundSlot>> {
        self.inner
            .background
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

// ----------------------------------------------------------------------------
// UI Ports
// ----------------------------------------------------------------------------

/// A UI context's handle on the host
#[derive(Debug)]
pub struct UiConnection {
    pub port: UiPort,
    pub inbox: mpsc::Receiver<MessageEnvelope>,
}

/// Posting side of a UI context
#[derive(Debug, Clone)]
pub struct UiPort {
    id: u64,
    host: LocalHost,
    inbox: mpsc::Sender<MessageEnvelope>,
}

impl UiPort {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Port for UiPort {
    async fn post(&self, envelope: MessageEnvelope) -> Result<(), PortError> {
        let tx = self
            .host
            .background_sender()
            .ok_or(PortError::ReceiverUnavailable)?;

        let inbound = Inbound {
            envelope,
            reply_to: self.inbox.clone(),
        };
        tx.try_send(inbound).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PortError::InboxFull,
            mpsc::error::TrySendError::Closed(_) => PortError::ReceiverUnavailable,
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_post_without_background_fails() {
        let host = LocalHost::new(8);
        let ui = host.connect_ui();
        let result = ui
            .port
            .post(MessageEnvelope::request("GetBalance", json!({})))
            .await;
        assert_eq!(result, Err(PortError::ReceiverUnavailable));
    }

    #[tokio::test]
    async fn test_request_and_reply_round_trip() {
        let host = LocalHost::new(8);
        let mut background = host.attach_background();
        let mut ui = host.connect_ui();

        let request = MessageEnvelope::request("GetBalance", json!({"address": "X"}));
        ui.port.post(request.clone()).await.unwrap();

        let inbound = background.recv().await.unwrap();
        assert_eq!(inbound.envelope, request);
        inbound.reply(request.respond(json!(10))).await.unwrap();

        let reply = ui.inbox.recv().await.unwrap();
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.payload, json!(10));
    }

    #[tokio::test]
    async fn test_suspend_and_reattach() {
        let host = LocalHost::new(8);
        let first = host.attach_background();
        let ui = host.connect_ui();

        host.suspend_background();
        assert!(!host.is_background_attached());
        assert!(ui
            .port
            .post(MessageEnvelope::request("k", json!(null)))
            .await
            .is_err());

        let mut second = host.attach_background();
        assert!(second.generation() > first.generation());
        host.detach(first.generation());
        assert!(host.is_background_attached());

        ui.port
            .post(MessageEnvelope::request("k", json!(null)))
            .await
            .unwrap();
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_ui_contexts() {
        let host = LocalHost::new(8);
        let mut open = host.connect_ui();
        let closed = host.connect_ui();
        drop(closed);

        let delivered = host.broadcast(&MessageEnvelope::broadcast("tick", json!(1)));
        assert_eq!(delivered, 1);
        assert_eq!(host.ui_count(), 1);
        assert_eq!(open.inbox.recv().await.unwrap().payload, json!(1));
    }
}
