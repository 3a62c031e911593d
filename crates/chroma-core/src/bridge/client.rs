//! Bridge Client
//!
//! The UI side of the bridge transport. `send` wraps every request in the
//! configured retry policy: while the background context cannot be reached
//! the envelope is re-posted after a fixed delay, up to `max_retries` total
//! attempts, and only then does the caller see a single connection error.
//! Once an attempt is delivered, the reply is awaited for at most
//! `request_timeout`; pending entries are removed on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::host::{LocalHost, Port};
use super::protocol::{Pong, PING};
use crate::config::BridgeConfig;
use crate::envelope::{EnvelopeKind, MessageEnvelope};
use crate::errors::BridgeError;
use crate::types::{ConnectionStatus, CorrelationId, MessageKey};

type PendingMap = DashMap<CorrelationId, oneshot::Sender<MessageEnvelope>>;

/// Capacity of the broadcast fan-out to local subscribers
const BROADCAST_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Client State
// ----------------------------------------------------------------------------

struct ClientInner {
    port: Arc<dyn Port>,
    config: BridgeConfig,
    pending: PendingMap,
    broadcasts: broadcast::Sender<MessageEnvelope>,
    status: watch::Sender<ConnectionStatus>,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!("Bridge connection status: {}", status);
        }
    }

    fn route(&self, envelope: MessageEnvelope) {
        match envelope.kind {
            EnvelopeKind::Response | EnvelopeKind::Error => {
                self.set_status(ConnectionStatus::Connected);
                match self.pending.remove(&envelope.id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(envelope);
                    }
                    None => trace!(
                        "Discarding reply {} for '{}' with no pending request",
                        envelope.id,
                        envelope.key
                    ),
                }
            }
            EnvelopeKind::Broadcast => {
                // No local subscribers is not an error.
                let _ = self.broadcasts.send(envelope);
            }
            EnvelopeKind::Request => {
                warn!("UI context received a request for '{}', ignoring", envelope.key);
            }
        }
    }

    fn abort_pump(&self) {
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.abort_pump();
    }
}

/// Removes a pending entry when the request finishes, times out or is dropped
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

// ----------------------------------------------------------------------------
// Bridge Client
// ----------------------------------------------------------------------------

/// Request/response client of one UI context. Clones share the connection.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

impl BridgeClient {
    /// Create a client posting through `port` and reading replies from `inbox`
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        port: Arc<dyn Port>,
        inbox: mpsc::Receiver<MessageEnvelope>,
        config: BridgeConfig,
    ) -> Self {
        let (broadcasts, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        let inner = Arc::new(ClientInner {
            port,
            config,
            pending: DashMap::new(),
            broadcasts,
            status,
            closed: AtomicBool::new(false),
            pump: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::pump(Arc::downgrade(&inner), inbox));
        *inner
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        Self { inner }
    }

    /// Open a UI context on `host` and wrap it in a client
    ///
    /// Starts the heartbeat when the config sets an interval.
    pub fn connect(host: &LocalHost, config: BridgeConfig) -> Self {
        let connection = host.connect_ui();
        let heartbeat = config.heartbeat_interval();
        let client = Self::new(Arc::new(connection.port), connection.inbox, config);
        if let Some(interval) = heartbeat {
            client.spawn_heartbeat(interval);
        }
        client
    }

    async fn pump(inner: Weak<ClientInner>, mut inbox: mpsc::Receiver<MessageEnvelope>) {
        while let Some(envelope) = inbox.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.route(envelope);
        }
        trace!("Bridge client inbox closed");
    }

    /// Send a typed request and await the typed reply
    pub async fn send<Req, Res>(
        &self,
        key: impl Into<MessageKey>,
        payload: &Req,
    ) -> Result<Res, BridgeError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let reply = self.send_value(key, payload).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Send an already encoded request
    pub async fn send_value(
        &self,
        key: impl Into<MessageKey>,
        payload: Value,
    ) -> Result<Value, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }

        let envelope = MessageEnvelope::request(key, payload);
        let key = envelope.key.to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.insert(envelope.id, reply_tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id: envelope.id,
        };

        self.deliver(&envelope).await?;

        let timeout = self.inner.config.request_timeout();
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => {
                warn!("Request '{}' ({}) timed out", key, envelope.id);
                Err(BridgeError::Timeout {
                    key,
                    timeout_ms: self.inner.config.request_timeout_ms,
                })
            }
        }
    }

    /// Post `envelope`, retrying delivery failures with a fixed delay
    async fn deliver(&self, envelope: &MessageEnvelope) -> Result<(), BridgeError> {
        let attempts = self.inner.config.attempts();
        let retry_after = self.inner.config.retry_after();

        let mut attempt = 1;
        loop {
            match self.inner.port.post(envelope.clone()).await {
                Ok(()) => {
                    self.inner.set_status(ConnectionStatus::Connected);
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    debug!(
                        "Delivery of '{}' failed (attempt {}/{}): {}",
                        envelope.key, attempt, attempts, e
                    );
                    self.inner.set_status(ConnectionStatus::Connecting);
                    tokio::time::sleep(retry_after).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.inner.set_status(ConnectionStatus::Disconnected);
                    warn!(
                        "Giving up on '{}' after {} attempts: {}",
                        envelope.key, attempts, e
                    );
                    return Err(BridgeError::Connection {
                        key: envelope.key.to_string(),
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Check that the background context answers
    pub async fn ping(&self) -> Result<(), BridgeError> {
        let _: Pong = self.send(PING, &Value::Null).await?;
        Ok(())
    }

    /// Ping every `interval` to keep the connection status fresh
    ///
    /// The task ends once every clone of this client has been dropped.
    pub fn spawn_heartbeat(&self, interval: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let client = BridgeClient { inner };
                if client.is_closed() {
                    break;
                }
                if let Err(e) = client.ping().await {
                    debug!("Heartbeat failed: {}", e);
                }
            }
        })
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Observe connection status changes
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Receive broadcasts sent by the background context
    pub fn subscribe_broadcasts(&self) -> broadcast::Receiver<MessageEnvelope> {
        self.inner.broadcasts.subscribe()
    }

    /// Number of requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Stop routing replies; outstanding and future requests fail with `Closed`
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.abort_pump();
            self.inner.pending.clear();
            self.inner.set_status(ConnectionStatus::Disconnected);
            debug!("Bridge client closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl core::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("status", &self.status())
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
