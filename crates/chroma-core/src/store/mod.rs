//! Central Store
//!
//! A `Store<T>` is the single source of truth for one piece of application
//! state. It lives in the background context, mirrors every committed
//! snapshot to durable storage and notifies subscribers synchronously, in
//! subscription order, after each commit.
//!
//! A store starts out `Loading`: it reads its snapshot from storage (or
//! writes the initial state when none exists) and only then becomes ready.
//! Mutations issued while loading are queued and applied in order once the
//! persisted snapshot has been adopted, so a persisted value is never
//! clobbered by a write that raced the load.
//!
//! Commits are published one at a time: the snapshot, its listener calls and
//! its persistence write all complete before the next commit starts. A
//! listener that mutates the store from inside a notification has its
//! mutation deferred until the current publication finishes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::errors::StoreError;
use crate::storage::{SharedStorage, StorageMap};

mod persistence;
mod registry;
mod subscription;

use persistence::PersistenceHandle;

pub use registry::{ErasedStore, JsonListener, Snapshot, StoreRegistry};
pub use subscription::Subscription;

// ----------------------------------------------------------------------------
// State Bounds
// ----------------------------------------------------------------------------

/// Bounds every store state type satisfies
pub trait StoreState: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> StoreState for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

// ----------------------------------------------------------------------------
// Merge Semantics
// ----------------------------------------------------------------------------

/// Shallow merge of `partial` into `base`
///
/// When both are JSON objects, each top-level field of `partial` replaces the
/// field of `base` with the same name. Anything else replaces `base` whole.
pub fn merge_json(base: &mut Value, partial: Value) {
    match partial {
        Value::Object(fields) if base.is_object() => {
            if let Value::Object(target) = base {
                target.extend(fields);
            }
        }
        other => *base = other,
    }
}

/// Apply a shallow partial update to a typed state
pub fn merge_state<T: StoreState>(previous: &T, partial: Value) -> Result<T, serde_json::Error> {
    let mut value = serde_json::to_value(previous)?;
    merge_json(&mut value, partial);
    serde_json::from_value(value)
}

// ----------------------------------------------------------------------------
// Store Health
// ----------------------------------------------------------------------------

/// Whether committed snapshots currently reach durable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreHealth {
    /// The latest snapshot was written successfully
    Durable,
    /// Persistence is disabled or failing; state survives only in memory
    MemoryOnly,
}

// ----------------------------------------------------------------------------
// Store Internals
// ----------------------------------------------------------------------------

type Listener<T> = Arc<dyn Fn(&T, u64) + Send + Sync>;
type ReadyCallback = Box<dyn FnOnce() + Send>;
type Mutator<T> = Box<dyn FnOnce(&mut T) + Send>;

enum Mutation<T> {
    Merge(Value),
    Update(Mutator<T>),
    Reset,
}

struct StoreData<T> {
    current: T,
    ready: bool,
    version: u64,
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
    ready_callbacks: Vec<(u64, ReadyCallback)>,
    pending: Vec<Mutation<T>>,
    /// Thread currently publishing a commit
    publisher: Option<ThreadId>,
    /// Mutations issued by listeners during a publication
    deferred: VecDeque<Mutation<T>>,
}

/// A committed snapshot awaiting publication
struct Commit<T> {
    snapshot: T,
    version: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

struct StoreInner<T: StoreState> {
    name: String,
    /// Identifies this opening of the store; versions restart with it
    epoch: Uuid,
    initial: T,
    data: Mutex<StoreData<T>>,
    publish_gate: Mutex<()>,
    ready_tx: watch::Sender<bool>,
    snapshot_tx: watch::Sender<T>,
    degraded: Arc<AtomicBool>,
    writer: Option<PersistenceHandle>,
}

impl<T: StoreState> StoreInner<T> {
    fn lock(&self) -> MutexGuard<'_, StoreData<T>> {
        // Listeners run outside the lock, so poisoning can only come from a
        // panicking update closure, which never leaves `current` half-written.
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serialize publications; the gate carries no data
    fn enter_publish(&self) -> PublishGuard<'_, T> {
        let gate = self
            .publish_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.lock().publisher = Some(thread::current().id());
        PublishGuard { inner: self, _gate: gate }
    }
}

/// Held while one thread publishes commits
struct PublishGuard<'a, T: StoreState> {
    inner: &'a StoreInner<T>,
    _gate: MutexGuard<'a, ()>,
}

impl<T: StoreState> Drop for PublishGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.lock().publisher = None;
    }
}

// ----------------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------------

/// Handle to a central store. Clones share the same state.
pub struct Store<T: StoreState> {
    inner: Arc<StoreInner<T>>,
}

impl<T: StoreState> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: StoreState> core::fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("ready", &self.is_ready())
            .field("health", &self.health())
            .finish()
    }
}

impl<T: StoreState> Store<T> {
    /// Open a store and start loading its persisted snapshot
    ///
    /// Without a storage handle, or with persistence disabled in `config`,
    /// the store is ready immediately and runs memory-only. Must be called
    /// within a tokio runtime when storage is supplied.
    pub fn open(
        name: impl Into<String>,
        initial: T,
        storage: Option<SharedStorage>,
        config: &StoreConfig,
    ) -> Self {
        let name = name.into();
        let storage = storage.filter(|_| config.persist);
        let key = config.storage_key(&name);
        let degraded = Arc::new(AtomicBool::new(storage.is_none()));

        let writer = storage.as_ref().map(|storage| {
            PersistenceHandle::spawn(
                name.clone(),
                key.clone(),
                Arc::clone(storage),
                Arc::clone(&degraded),
            )
        });

        let (ready_tx, _) = watch::channel(false);
        let (snapshot_tx, _) = watch::channel(initial.clone());

        let store = Self {
            inner: Arc::new(StoreInner {
                name,
                epoch: Uuid::new_v4(),
                initial: initial.clone(),
                data: Mutex::new(StoreData {
                    current: initial.clone(),
                    ready: false,
                    version: 0,
                    next_id: 0,
                    listeners: Vec::new(),
                    ready_callbacks: Vec::new(),
                    pending: Vec::new(),
                    publisher: None,
                    deferred: VecDeque::new(),
                }),
                publish_gate: Mutex::new(()),
                ready_tx,
                snapshot_tx,
                degraded,
                writer,
            }),
        };

        match storage {
            Some(storage) => {
                debug!("Loading store '{}' from '{}'", store.name(), key);
                let loader = store.clone();
                tokio::spawn(async move { loader.load(storage, key).await });
            }
            None => {
                debug!("Store '{}' runs memory-only", store.name());
                store.finish_loading(initial);
            }
        }

        store
    }

    /// Open a memory-only store that is ready immediately
    pub fn in_memory(name: impl Into<String>, initial: T) -> Self {
        Self::open(name, initial, None, &StoreConfig::default())
    }

    /// Name the store was opened under
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current committed snapshot
    pub fn get_state(&self) -> T {
        self.inner.lock().current.clone()
    }

    /// Identifier of this opening of the store
    ///
    /// Versions count from the load of one opening, so a reopened store
    /// (after a background restart) has a new epoch.
    pub fn epoch(&self) -> Uuid {
        self.inner.epoch
    }

    /// Number of commits so far, including the load
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Current snapshot together with its version, read atomically
    pub fn versioned_state(&self) -> (T, u64) {
        let data = self.inner.lock();
        (data.current.clone(), data.version)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    pub fn health(&self) -> StoreHealth {
        if self.inner.degraded.load(Ordering::SeqCst) {
            StoreHealth::MemoryOnly
        } else {
            StoreHealth::Durable
        }
    }

    /// Wait until the persisted snapshot has been adopted
    pub async fn ready(&self) {
        let mut rx = self.inner.ready_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once ready.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Shallow-merge `partial` into the state
    ///
    /// `partial` must serialize to a JSON object whose fields fit the state
    /// type; otherwise the update is rejected and nothing changes. Called
    /// from inside a listener, the update is committed after the current
    /// notification round.
    pub fn set_state<P: Serialize>(&self, partial: P) -> Result<(), StoreError> {
        let partial = serde_json::to_value(partial).map_err(|e| StoreError::InvalidPartial {
            store: self.name().to_string(),
            reason: e.to_string(),
        })?;
        self.merge_value(partial)
    }

    /// Shallow-merge an already encoded partial update
    pub fn merge_value(&self, partial: Value) -> Result<(), StoreError> {
        if !partial.is_object() {
            return Err(StoreError::InvalidPartial {
                store: self.name().to_string(),
                reason: "partial update must be an object".to_string(),
            });
        }
        self.apply(Mutation::Merge(partial))
    }

    /// Replace the state with the result of `f` applied to a copy of it
    ///
    /// `f` runs while the store is locked and must not call back into it.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        // Update mutations cannot be rejected.
        let _ = self.apply(Mutation::Update(Box::new(f)));
    }

    /// Restore the initial state
    pub fn reset(&self) {
        let _ = self.apply(Mutation::Reset);
    }

    /// Register a listener called with every committed snapshot
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_versioned(move |state: &T, _| listener(state))
    }

    /// Like `subscribe`, also passing the version of each commit
    pub fn subscribe_versioned<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T, u64) + Send + Sync + 'static,
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

    /// Run `callback` once the store is ready; immediately if it already is
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
                return self.ready_subscription(id);
            }
        }
        callback();
        Subscription::detached()
    }

    fn ready_subscription(&self, id: u64) -> Subscription {
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.lock().ready_callbacks.retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Reactive view of the committed snapshots
    pub fn watch(&self) -> watch::Receiver<T> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Wait until every snapshot committed so far has been handed to storage
    pub async fn flush(&self) {
        self.ready().await;
        if let Some(writer) = &self.inner.writer {
            writer.flush().await;
        }
    }

    /// Flush outstanding writes and stop the persistence worker
    pub async fn shutdown(&self) {
        self.ready().await;
        if let Some(writer) = &self.inner.writer {
            writer.shutdown().await;
        }
        debug!("Store '{}' shut down", self.name());
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    async fn load(&self, storage: SharedStorage, key: String) {
        let initial = self.inner.initial.clone();

        let persisted = match storage.get(std::slice::from_ref(&key)).await {
            Ok(mut found) => found.remove(&key),
            Err(e) => {
                self.inner.degraded.store(true, Ordering::SeqCst);
                warn!(
                    "Could not read snapshot of store '{}', continuing in memory: {}",
                    self.name(),
                    e
                );
                self.finish_loading(initial);
                return;
            }
        };

        let snapshot = match persisted.map(|value| merge_state(&initial, value)) {
            Some(Ok(state)) => {
                debug!("Adopted persisted snapshot of store '{}'", self.name());
                state
            }
            Some(Err(e)) => {
                warn!(
                    "Discarding unreadable snapshot of store '{}': {}",
                    self.name(),
                    e
                );
                self.write_initial(&storage, &key, &initial).await;
                initial
            }
            None => {
                self.write_initial(&storage, &key, &initial).await;
                initial
            }
        };

        self.finish_loading(snapshot);
    }

    async fn write_initial(&self, storage: &SharedStorage, key: &str, initial: &T) {
        let value = match serde_json::to_value(initial) {
            Ok(value) => value,
            Err(e) => {
                self.inner.degraded.store(true, Ordering::SeqCst);
                warn!("Could not encode store '{}': {}", self.name(), e);
                return;
            }
        };

        let mut items = StorageMap::new();
        items.insert(key.to_string(), value);
        if let Err(e) = storage.set(items).await {
            self.inner.degraded.store(true, Ordering::SeqCst);
            warn!(
                "Could not write initial state of store '{}', continuing in memory: {}",
                self.name(),
                e
            );
        }
    }

    fn finish_loading(&self, snapshot: T) {
        let _publishing = self.inner.enter_publish();

        let (commit, callbacks, queued) = {
            let mut data = self.inner.lock();
            data.current = snapshot.clone();
            data.ready = true;
            data.version += 1;
            // Queued updates run before anything a listener issues from now on.
            let pending = std::mem::take(&mut data.pending);
            let queued = pending.len();
            for mutation in pending.into_iter().rev() {
                data.deferred.push_front(mutation);
            }
            let commit = Commit {
                snapshot,
                version: data.version,
                listeners: data.listeners.clone(),
            };
            (commit, std::mem::take(&mut data.ready_callbacks), queued)
        };

        self.inner.ready_tx.send_replace(true);
        info!("Store '{}' is ready", self.name());

        self.publish(commit, false);
        for (_, callback) in callbacks {
            callback();
        }

        if queued > 0 {
            debug!(
                "Applying {} updates queued while store '{}' was loading",
                queued,
                self.name()
            );
        }
        self.drain_deferred();
    }

    // ------------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------------

    fn apply(&self, mutation: Mutation<T>) -> Result<(), StoreError> {
        {
            let mut data = self.inner.lock();
            let reentrant = data.publisher == Some(thread::current().id());
            if !data.ready || reentrant {
                if let Mutation::Merge(partial) = &mutation {
                    self.merge(&data.current, partial.clone())?;
                }
                if data.ready {
                    data.deferred.push_back(mutation);
                } else {
                    data.pending.push(mutation);
                }
                return Ok(());
            }
        }

        let _publishing = self.inner.enter_publish();
        let commit = self.commit(mutation)?;
        self.publish(commit, true);
        self.drain_deferred();
        Ok(())
    }

    /// Publish mutations deferred by listeners, oldest first
    ///
    /// Must be called while holding the publish gate.
    fn drain_deferred(&self) {
        loop {
            let Some(mutation) = self.inner.lock().deferred.pop_front() else {
                break;
            };
            match self.commit(mutation) {
                Ok(commit) => self.publish(commit, true),
                Err(e) => warn!("Dropped deferred update of store '{}': {}", self.name(), e),
            }
        }
    }

    fn commit(&self, mutation: Mutation<T>) -> Result<Commit<T>, StoreError> {
        let mut data = self.inner.lock();
        let next = match mutation {
            Mutation::Merge(partial) => self.merge(&data.current, partial)?,
            Mutation::Update(f) => {
                let mut next = data.current.clone();
                f(&mut next);
                next
            }
            Mutation::Reset => self.inner.initial.clone(),
        };

        data.current = next.clone();
        data.version += 1;
        Ok(Commit {
            snapshot: next,
            version: data.version,
            listeners: data.listeners.clone(),
        })
    }

    fn merge(&self, current: &T, partial: Value) -> Result<T, StoreError> {
        merge_state(current, partial).map_err(|e| StoreError::InvalidPartial {
            store: self.name().to_string(),
            reason: e.to_string(),
        })
    }

    fn publish(&self, commit: Commit<T>, persist: bool) {
        let Commit {
            snapshot,
            version,
            listeners,
        } = commit;
        self.inner.snapshot_tx.send_replace(snapshot.clone());

        if persist {
            if let Some(writer) = &self.inner.writer {
                match serde_json::to_value(&snapshot) {
                    Ok(value) => writer.write(value),
                    Err(e) => {
                        self.inner.degraded.store(true, Ordering::SeqCst);
                        warn!("Could not encode store '{}': {}", self.name(), e);
                    }
                }
            }
        }

        for (_, listener) in listeners {
            listener(&snapshot, version);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KeyValueStorage, MemoryStorage};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct WalletState {
        wallets: Vec<String>,
        selected: Option<usize>,
    }

    fn config() -> StoreConfig {
        StoreConfig::default()
    }

    #[test]
    fn test_merge_json_is_shallow() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": 1});
        merge_json(&mut base, json!({"a": {"x": 3}}));
        assert_eq!(base, json!({"a": {"x": 3}, "b": 1}));
    }

    #[tokio::test]
    async fn test_memory_store_is_ready_immediately() {
        let store = Store::in_memory("wallet", WalletState::default());
        assert!(store.is_ready());
        assert_eq!(store.health(), StoreHealth::MemoryOnly);
        assert_eq!(store.version(), 1);
    }

    #[tokio::test]
    async fn test_set_state_notifies_in_order() {
        let store = Store::in_memory("wallet", WalletState::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        let _a = store.subscribe(move |state: &WalletState| {
            first.lock().unwrap().push(("first", state.wallets.len()));
        });
        let second = Arc::clone(&order);
        let _b = store.subscribe(move |state: &WalletState| {
            second.lock().unwrap().push(("second", state.wallets.len()));
        });

        store.set_state(json!({"wallets": ["w1"]})).unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec![("first", 1), ("second", 1)]
        );
        assert_eq!(store.get_state().wallets, vec!["w1".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_notifications() {
        let store = Store::in_memory("wallet", WalletState::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let subscription = store.subscribe(move |_: &WalletState| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.set_state(json!({"selected": 0})).unwrap();
        subscription.unsubscribe();
        store.set_state(json!({"selected": 1})).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_partial_is_rejected() {
        let store = Store::in_memory("wallet", WalletState::default());
        let err = store.set_state(json!({"wallets": 7})).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPartial { .. }));
        assert!(store.set_state(json!([1, 2])).is_err());
        assert_eq!(store.get_state(), WalletState::default());
    }

    #[tokio::test]
    async fn test_reset_restores_initial() {
        let initial = WalletState {
            wallets: vec!["seed".into()],
            selected: None,
        };
        let store = Store::in_memory("wallet", initial.clone());
        store.update(|state| state.wallets.push("w2".into()));
        assert_eq!(store.get_state().wallets.len(), 2);
        store.reset();
        assert_eq!(store.get_state(), initial);
    }

    #[tokio::test]
    async fn test_persisted_snapshot_wins_over_initial() {
        let storage = MemoryStorage::new();
        let mut items = StorageMap::new();
        items.insert(
            config().storage_key("wallet"),
            json!({"wallets": ["persisted"]}),
        );
        storage.set(items).await.unwrap();

        let store = Store::open(
            "wallet",
            WalletState {
                wallets: vec![],
                selected: Some(3),
            },
            Some(Arc::new(storage)),
            &config(),
        );
        store.ready().await;

        let state = store.get_state();
        assert_eq!(state.wallets, vec!["persisted".to_string()]);
        assert_eq!(state.selected, Some(3));
        assert_eq!(store.health(), StoreHealth::Durable);
    }

    #[tokio::test]
    async fn test_initial_state_written_when_nothing_persisted() {
        let storage = MemoryStorage::new();
        let store = Store::open(
            "wallet",
            WalletState::default(),
            Some(Arc::new(storage.clone())),
            &config(),
        );
        store.ready().await;
        assert_eq!(
            storage.peek("chroma:store:wallet"),
            Some(json!({"wallets": [], "selected": null}))
        );
    }

    #[tokio::test]
    async fn test_updates_while_loading_are_queued() {
        let storage = MemoryStorage::new();
        let mut items = StorageMap::new();
        items.insert(
            config().storage_key("wallet"),
            json!({"wallets": ["persisted"]}),
        );
        storage.set(items).await.unwrap();

        let store = Store::open(
            "wallet",
            WalletState::default(),
            Some(Arc::new(storage.clone())),
            &config(),
        );
        store.set_state(json!({"selected": 0})).unwrap();
        store.flush().await;

        let state = store.get_state();
        assert_eq!(state.wallets, vec!["persisted".to_string()]);
        assert_eq!(state.selected, Some(0));
        assert_eq!(
            storage.peek("chroma:store:wallet"),
            Some(json!({"wallets": ["persisted"], "selected": 0}))
        );
    }

    #[tokio::test]
    async fn test_on_ready_fires_once() {
        let storage = MemoryStorage::new();
        let store = Store::open(
            "wallet",
            WalletState::default(),
            Some(Arc::new(storage)),
            &config(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _subscription = store.on_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.ready().await;
        store.set_state(json!({"selected": 1})).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&calls);
        let _subscription = store.on_ready(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_write_failure_degrades_to_memory_only() {
        let storage = MemoryStorage::new();
        let store = Store::open(
            "wallet",
            WalletState::default(),
            Some(Arc::new(storage.clone())),
            &config(),
        );
        store.ready().await;
        assert_eq!(store.health(), StoreHealth::Durable);

        storage.set_available(false);
        store.set_state(json!({"wallets": ["w1"]})).unwrap();
        store.flush().await;
        assert_eq!(store.health(), StoreHealth::MemoryOnly);
        assert_eq!(store.get_state().wallets, vec!["w1".to_string()]);

        storage.set_available(true);
        store.set_state(json!({"selected": 0})).unwrap();
        store.flush().await;
        assert_eq!(store.health(), StoreHealth::Durable);
    }

    #[tokio::test]
    async fn test_listener_updates_publish_after_current_commit() {
        let storage = MemoryStorage::new();
        let store = Store::open(
            "wallet",
            WalletState::default(),
            Some(Arc::new(storage.clone())),
            &config(),
        );
        store.ready().await;

        let writer = store.clone();
        let _select = store.subscribe(move |state: &WalletState| {
            if state.wallets.len() == 1 && state.selected.is_none() {
                writer.set_state(json!({"selected": 0})).unwrap();
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let _record = store.subscribe_versioned(move |state: &WalletState, version| {
            recorder.lock().unwrap().push((version, state.selected));
        });

        store.set_state(json!({"wallets": ["w1"]})).unwrap();
        store.flush().await;

        assert_eq!(*seen.lock().unwrap(), vec![(2, None), (3, Some(0))]);
        assert_eq!(store.get_state().selected, Some(0));
        assert_eq!(
            storage.peek("chroma:store:wallet"),
            Some(json!({"wallets": ["w1"], "selected": 0}))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_publish_in_version_order() {
        let storage = MemoryStorage::new();
        let store = Store::open(
            "wallet",
            WalletState::default(),
            Some(Arc::new(storage.clone())),
            &config(),
        );
        store.ready().await;

        let versions = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&versions);
        let _record = store.subscribe_versioned(move |_: &WalletState, version| {
            recorder.lock().unwrap().push(version);
        });

        let writers: Vec<_> = (0..8)
            .map(|task| {
                let store = store.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        store.update(move |state| state.wallets.push(format!("{}-{}", task, i)));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        store.flush().await;

        let versions = versions.lock().unwrap().clone();
        assert_eq!(versions, (2..=201).collect::<Vec<u64>>());
        let persisted = storage.peek("chroma:store:wallet").unwrap();
        assert_eq!(persisted, serde_json::to_value(store.get_state()).unwrap());
        assert_eq!(store.get_state().wallets.len(), 200);
    }

    #[tokio::test]
    async fn test_watch_sees_latest_snapshot() {
        let store = Store::in_memory("wallet", WalletState::default());
        let mut rx = store.watch();
        store.set_state(json!({"selected": 2})).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().selected, Some(2));
    }
}
