//! Type-erased store access
//!
//! The background runtime serves store snapshots to UI contexts without
//! knowing their concrete state types; `ErasedStore` exposes a store through
//! JSON values and `StoreRegistry` indexes them by name.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Store, StoreHealth, StoreState, Subscription};
use crate::errors::{RegistrationError, StoreError};

/// Listener receiving committed snapshots as JSON
pub type JsonListener = Box<dyn Fn(Snapshot) + Send + Sync>;

/// A committed state encoded as JSON, with its commit version
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: Value,
    pub epoch: Uuid,
    pub version: u64,
}

// ----------------------------------------------------------------------------
// Erased Store
// ----------------------------------------------------------------------------

/// A store viewed through JSON values
#[async_trait]
pub trait ErasedStore: Send + Sync {
    fn name(&self) -> &str;

    /// Current snapshot encoded as JSON
    fn snapshot(&self) -> Result<Snapshot, StoreError>;

    fn is_ready(&self) -> bool;

    fn health(&self) -> StoreHealth;

    /// Shallow-merge an encoded partial update
    fn merge(&self, partial: Value) -> Result<(), StoreError>;

    fn reset(&self);

    fn subscribe_json(&self, listener: JsonListener) -> Subscription;

    async fn ready(&self);

    async fn flush(&self);

    async fn shutdown(&self);
}

#[async_trait]
impl<T: StoreState> ErasedStore for Store<T> {
    fn name(&self) -> &str {
        Store::name(self)
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let (state, version) = self.versioned_state();
        let state = serde_json::to_value(state).map_err(|e| StoreError::Encoding {
            store: Store::name(self).to_string(),
            reason: e.to_string(),
        })?;
        Ok(Snapshot {
            state,
            epoch: self.epoch(),
            version,
        })
    }

    fn is_ready(&self) -> bool {
        Store::is_ready(self)
    }

    fn health(&self) -> StoreHealth {
        Store::health(self)
    }

    fn merge(&self, partial: Value) -> Result<(), StoreError> {
        self.merge_value(partial)
    }

    fn reset(&self) {
        Store::reset(self)
    }

    fn subscribe_json(&self, listener: JsonListener) -> Subscription {
        let name = Store::name(self).to_string();
        let epoch = self.epoch();
        self.subscribe_versioned(move |state: &T, version| match serde_json::to_value(state) {
            Ok(state) => listener(Snapshot {
                state,
                epoch,
                version,
            }),
            Err(e) => warn!("Could not encode snapshot of store '{}': {}", name, e),
        })
    }

    async fn ready(&self) {
        Store::ready(self).await
    }

    async fn flush(&self) {
        Store::flush(self).await
    }

    async fn shutdown(&self) {
        Store::shutdown(self).await
    }
}

// ----------------------------------------------------------------------------
// Store Registry
// ----------------------------------------------------------------------------

/// Named stores of one background context
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: Arc<RwLock<BTreeMap<String, Arc<dyn ErasedStore>>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under its own name
    pub fn register(&self, store: Arc<dyn ErasedStore>) -> Result<(), RegistrationError> {
        let name = store.name().to_string();
        let mut stores = self
            .stores
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if stores.contains_key(&name) {
            return Err(RegistrationError::DuplicateStore { name });
        }
        debug!("Registered store '{}'", name);
        stores.insert(name, store);
        Ok(())
    }

    /// Look up a store by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn ErasedStore>, StoreError> {
        self.stores
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownStore {
                name: name.to_string(),
            })
    }

    /// Registered store names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.stores
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// All registered stores in name order
    pub fn all(&self) -> Vec<Arc<dyn ErasedStore>> {
        self.stores
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stores
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every store has loaded
    pub async fn ready_all(&self) {
        let stores = self.all();
        join_all(stores.iter().map(|store| store.ready())).await;
    }

    /// Flush and stop every store's persistence
    pub async fn shutdown_all(&self) {
        let stores = self.all();
        join_all(stores.iter().map(|store| store.shutdown())).await;
    }
}

impl core::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("stores", &self.names())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_duplicate_store_names_rejected() {
        let registry = StoreRegistry::new();
        registry
            .register(Arc::new(Store::in_memory("wallet", json!({}))))
            .unwrap();
        let err = registry
            .register(Arc::new(Store::in_memory("wallet", json!({}))))
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::DuplicateStore {
                name: "wallet".into()
            }
        );
        assert_eq!(registry.names(), vec!["wallet".to_string()]);
    }

    #[tokio::test]
    async fn test_erased_merge_and_subscribe() {
        let registry = StoreRegistry::new();
        registry
            .register(Arc::new(Store::in_memory("prices", json!({"btc": 1}))))
            .unwrap();
        let store = registry.get("prices").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = store.subscribe_json(Box::new(move |snapshot| {
            sink.lock().unwrap().push(snapshot);
        }));

        store.merge(json!({"eth": 2})).unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.state, json!({"btc": 1, "eth": 2}));
        assert_eq!(snapshot.version, 2);
        assert_eq!(*seen.lock().unwrap(), vec![snapshot]);

        assert!(matches!(
            registry.get("missing"),
            Err(StoreError::UnknownStore { .. })
        ));
    }
}
