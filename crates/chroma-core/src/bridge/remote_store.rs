//! UI-context view of a central store
//!
//! A `RemoteStore<T>` caches the latest snapshot the background context has
//! sent for one store. Mutations are routed to the background as bridge
//! requests and the cache only ever changes to a snapshot the background
//! committed, so UI contexts cannot diverge from the owning store.
//!
//! Every snapshot carries the epoch of the store opening it came from and
//! its commit version within that epoch. Older versions of the current
//! epoch are ignored. A snapshot from a new epoch (the background context
//! restarted and reopened the store) always replaces the cache, after which
//! snapshots from the epoch it replaced are ignored.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::client::BridgeClient;
use super::protocol::{
    StoreChanged, StoreRequest, StoreSetRequest, StoreSnapshot, STORE_CHANGED, STORE_GET,
    STORE_RESET, STORE_SET,
};
use crate::envelope::MessageEnvelope;
use crate::errors::BridgeError;
use crate::store::{StoreState, Subscription};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ReadyCallback = Box<dyn FnOnce() + Send>;

struct RemoteData<T> {
    current: T,
    /// Epoch and version of the cached snapshot
    seen: Option<(Uuid, u64)>,
    /// Epochs replaced by a newer store opening
    retired: Vec<Uuid>,
    ready: bool,
    degraded: bool,
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
    ready_callbacks: Vec<(u64, ReadyCallback)>,
}

struct RemoteInner<T: StoreState> {
    name: String,
    client: BridgeClient,
    data: Mutex<RemoteData<T>>,
    snapshot_tx: watch::Sender<T>,
    ready_tx: watch::Sender<bool>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: StoreState> RemoteInner<T> {
    fn lock(&self) -> MutexGuard<'_, RemoteData<T>> {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adopt a background snapshot unless a newer one has been seen
    fn apply(
        &self,
        state: serde_json::Value,
        epoch: Uuid,
        version: u64,
        ready: bool,
        degraded: Option<bool>,
    ) {
        let state: T = match serde_json::from_value(state) {
            Ok(state) => state,
            Err(e) => {
                warn!("Snapshot of store '{}' does not decode: {}", self.name, e);
                return;
            }
        };

        let (changed, listeners, callbacks) = {
            let mut data = self.lock();
            if data.retired.contains(&epoch) {
                debug!("Ignoring snapshot of store '{}' from a retired epoch", self.name);
                return;
            }
            if let Some(degraded) = degraded {
                data.degraded = degraded;
            }
            let changed = match data.seen {
                None => true,
                Some((seen_epoch, seen_version)) if seen_epoch == epoch => version > seen_version,
                Some((seen_epoch, _)) => {
                    debug!("Store '{}' was reopened by the background context", self.name);
                    data.retired.push(seen_epoch);
                    true
                }
            };
            if changed {
                data.current = state.clone();
                data.seen = Some((epoch, version));
            }
            let callbacks = if ready && !data.ready {
                data.ready = true;
                std::mem::take(&mut data.ready_callbacks)
            } else {
                Vec::new()
            };
            let listeners = if changed {
                data.listeners.clone()
            } else {
                Vec::new()
            };
            (changed, listeners, callbacks)
        };

        if ready {
            self.ready_tx.send_if_modified(|current| !std::mem::replace(current, true));
        }
        if changed {
            self.snapshot_tx.send_replace(state.clone());
            for (_, listener) in listeners {
                listener(&state);
            }
        }
        for (_, callback) in callbacks {
            callback();
        }
    }

    fn apply_snapshot(&self, snapshot: StoreSnapshot) {
        self.apply(
            snapshot.state,
            snapshot.epoch,
            snapshot.version,
            snapshot.ready,
            Some(snapshot.degraded),
        );
    }
}

impl<T: StoreState> Drop for RemoteInner<T> {
    fn drop(&mut self) {
        let task = self
            .listener_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Remote Store
// ----------------------------------------------------------------------------

/// Read-mostly view of a background store. Clones share the cache.
pub struct RemoteStore<T: StoreState> {
    inner: Arc<RemoteInner<T>>,
}

impl<T: StoreState> Clone for RemoteStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: StoreState> RemoteStore<T> {
    /// Start following the store `name`
    ///
    /// `placeholder` is served by `get_state` until the first snapshot
    /// arrives. The initial fetch runs in the background; use `connect` to
    /// wait for it.
    pub fn attach(client: &BridgeClient, name: impl Into<String>, placeholder: T) -> Self {
        let store = Self::follow(client, name.into(), placeholder);
        let fetcher = store.clone();
        tokio::spawn(async move {
            if let Err(e) = fetcher.refresh().await {
                debug!(
                    "Initial fetch of store '{}' failed: {}",
                    fetcher.name(),
                    e
                );
            }
        });
        store
    }

    /// Follow the store `name` and wait for its first snapshot
    pub async fn connect(
        client: &BridgeClient,
        name: impl Into<String>,
        placeholder: T,
    ) -> Result<Self, BridgeError> {
        let store = Self::follow(client, name.into(), placeholder);
        store.refresh().await?;
        Ok(store)
    }

    fn follow(client: &BridgeClient, name: String, placeholder: T) -> Self {
        let (snapshot_tx, _) = watch::channel(placeholder.clone());
        let (ready_tx, _) = watch::channel(false);
        let inner = Arc::new(RemoteInner {
            name,
            client: client.clone(),
            data: Mutex::new(RemoteData {
                current: placeholder,
                seen: None,
                retired: Vec::new(),
                ready: false,
                degraded: false,
                next_id: 0,
                listeners: Vec::new(),
                ready_callbacks: Vec::new(),
            }),
            snapshot_tx,
            ready_tx,
            listener_task: Mutex::new(None),
        });

        let broadcasts = client.subscribe_broadcasts();
        let task = tokio::spawn(Self::listen(Arc::downgrade(&inner), broadcasts));
        *inner
            .listener_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);

        Self { inner }
    }

    async fn listen(
        inner: std::sync::Weak<RemoteInner<T>>,
        mut broadcasts: broadcast::Receiver<MessageEnvelope>,
    ) {
        loop {
            let envelope = match broadcasts.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    warn!(
                        "Store '{}' missed {} broadcasts, refetching",
                        inner.name, skipped
                    );
                    let store = RemoteStore { inner };
                    if let Err(e) = store.refresh().await {
                        debug!("Refetch of store '{}' failed: {}", store.name(), e);
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if envelope.key.as_str() != STORE_CHANGED {
                continue;
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match serde_json::from_value::<StoreChanged>(envelope.payload) {
                Ok(changed) if changed.store == inner.name => {
                    inner.apply(changed.state, changed.epoch, changed.version, true, None);
                }
                Ok(_) => {}
                Err(e) => warn!("Malformed store broadcast: {}", e),
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Latest snapshot received from the background context
    pub fn get_state(&self) -> T {
        self.inner.lock().current.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    /// Whether the background store reported it is running memory-only
    pub fn is_degraded(&self) -> bool {
        self.inner.lock().degraded
    }

    /// Wait until a ready snapshot has been received
    pub async fn ready(&self) {
        let mut rx = self.inner.ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Fetch the current snapshot from the background context
    pub async fn refresh(&self) -> Result<T, BridgeError> {
        let snapshot: StoreSnapshot = self
            .inner
            .client
            .send(
                STORE_GET,
                &StoreRequest {
                    store: self.name().to_string(),
                },
            )
            .await?;
        self.inner.apply_snapshot(snapshot);
        Ok(self.get_state())
    }

    /// Ask the background context to shallow-merge `partial`
    pub async fn set_state<P: Serialize>(&self, partial: P) -> Result<T, BridgeError> {
        let request = StoreSetRequest {
            store: self.name().to_string(),
            partial: serde_json::to_value(partial)?,
        };
        let snapshot: StoreSnapshot = self.inner.client.send(STORE_SET, &request).await?;
        self.inner.apply_snapshot(snapshot);
        Ok(self.get_state())
    }

    /// Ask the background context to restore the initial state
    pub async fn reset(&self) -> Result<T, BridgeError> {
        let request = StoreRequest {
            store: self.name().to_string(),
        };
        let snapshot: StoreSnapshot = self.inner.client.send(STORE_RESET, &request).await?;
        self.inner.apply_snapshot(snapshot);
        Ok(self.get_state())
    }

    /// Register a listener called whenever a newer snapshot is adopted
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut data = self.inner.lock();
            let id = data.next_id;
            data.next_id += 1;
            data.listeners.push((id, Arc::new(listener)));
            id
        };
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.lock().listeners.retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Run `callback` once ready; immediately if already ready
    pub fn on_ready<F>(&self, callback: F) -> Subscription
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut data = self.inner.lock();
            if !data.ready {
                let id = data.next_id;
                data.next_id += 1;
                data.ready_callbacks.push((id, Box::new(callback)));
                drop(data);
                let inner = Arc::downgrade(&self.inner);
                return Subscription::new(move || {
                    if let Some(inner) = inner.upgrade() {
                        inner.lock().ready_callbacks.retain(|(entry, _)| *entry != id);
                    }
                });
            }
        }
        callback();
        Subscription::detached()
    }

    /// Reactive view of the cached snapshot
    pub fn watch(&self) -> watch::Receiver<T> {
        self.inner.snapshot_tx.subscribe()
    }
}

impl<T: StoreState> core::fmt::Debug for RemoteStore<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("name", &self.inner.name)
            .field("ready", &self.is_ready())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
