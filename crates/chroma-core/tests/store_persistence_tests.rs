//! Integration Tests for Central Store Persistence
//!
//! Exercises the Loading -> Ready lifecycle against shared storage handles,
//! simulating process restarts by dropping every store and reopening it
//! against the same storage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chroma_core::{
    FileStorage, KeyValueStorage, MemoryStorage, SharedStorage, Store, StoreConfig, StoreHealth,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;
use tokio_test::assert_ok;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct WalletState {
    wallets: Vec<String>,
}

fn open_wallet(storage: SharedStorage) -> Store<WalletState> {
    Store::open(
        "wallet",
        WalletState::default(),
        Some(storage),
        &StoreConfig::default(),
    )
}

// ----------------------------------------------------------------------------
// Lifecycle Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_fresh_wallet_store_initializes_and_notifies_once() {
    let storage = MemoryStorage::new();
    let store = open_wallet(Arc::new(storage.clone()));
    assert!(!store.is_ready());
    assert_eq!(store.get_state(), WalletState::default());

    let notifications = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notifications);
    let _subscription = store.subscribe(move |state: &WalletState| {
        sink.lock().unwrap().push(state.clone());
    });

    timeout(Duration::from_secs(1), store.ready())
        .await
        .expect("store should become ready");

    assert!(store.is_ready());
    assert_eq!(
        *notifications.lock().unwrap(),
        vec![WalletState { wallets: vec![] }]
    );
    assert_eq!(storage.peek("chroma:store:wallet"), Some(json!({"wallets": []})));
}

#[tokio::test]
async fn test_crash_and_reload_restores_wallets() {
    let storage = MemoryStorage::new();

    {
        let store = open_wallet(Arc::new(storage.clone()));
        store.ready().await;
        assert_ok!(store.set_state(json!({"wallets": ["w"]})));
        store.flush().await;
        assert_eq!(
            storage.peek("chroma:store:wallet"),
            Some(json!({"wallets": ["w"]}))
        );
        // Dropped without shutdown, as on a crash
    }

    let reloaded = open_wallet(Arc::new(storage.clone()));
    reloaded.ready().await;
    assert_eq!(
        reloaded.get_state(),
        WalletState {
            wallets: vec!["w".into()]
        }
    );
}

#[tokio::test]
async fn test_reset_persists_initial_snapshot() {
    let storage = MemoryStorage::new();
    let store = open_wallet(Arc::new(storage.clone()));
    store.ready().await;

    store.set_state(json!({"wallets": ["a", "b"]})).unwrap();
    store.reset();
    store.flush().await;

    assert_eq!(store.get_state(), WalletState::default());
    assert_eq!(storage.peek("chroma:store:wallet"), Some(json!({"wallets": []})));
}

#[tokio::test]
async fn test_unavailable_storage_keeps_store_usable() {
    let storage = MemoryStorage::new();
    storage.set_available(false);

    let store = open_wallet(Arc::new(storage.clone()));
    store.ready().await;
    assert_eq!(store.health(), StoreHealth::MemoryOnly);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let _subscription = store.subscribe(move |_: &WalletState| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    store.set_state(json!({"wallets": ["w"]})).unwrap();
    store.flush().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_state().wallets, vec!["w".to_string()]);
    assert_eq!(storage.write_count(), 0);
}

#[tokio::test]
async fn test_persistence_disabled_never_touches_storage() {
    let storage = MemoryStorage::new();
    let config = StoreConfig {
        persist: false,
        ..StoreConfig::default()
    };
    let store = Store::open(
        "wallet",
        WalletState::default(),
        Some(Arc::new(storage.clone())),
        &config,
    );
    assert!(store.is_ready());
    store.set_state(json!({"wallets": ["w"]})).unwrap();
    store.flush().await;
    assert_eq!(storage.write_count(), 0);
    assert_eq!(store.health(), StoreHealth::MemoryOnly);
}

#[tokio::test]
async fn test_file_storage_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");

    {
        let store = open_wallet(Arc::new(FileStorage::new(&path)));
        store.ready().await;
        store.set_state(json!({"wallets": ["cold"]})).unwrap();
        store.shutdown().await;
    }

    let storage = FileStorage::new(&path);
    let keys = storage.keys().await.unwrap();
    assert_eq!(keys, vec!["chroma:store:wallet".to_string()]);

    let reloaded = open_wallet(Arc::new(storage));
    reloaded.ready().await;
    assert_eq!(reloaded.get_state().wallets, vec!["cold".to_string()]);
}

#[tokio::test]
async fn test_burst_of_updates_persists_latest_snapshot() {
    let storage = MemoryStorage::new();
    let store = open_wallet(Arc::new(storage.clone()));
    store.ready().await;

    for i in 0..50 {
        store.update(move |state| state.wallets.push(format!("w{}", i)));
    }
    store.flush().await;

    let persisted = storage.peek("chroma:store:wallet").unwrap();
    assert_eq!(persisted["wallets"].as_array().unwrap().len(), 50);
    assert_eq!(persisted["wallets"][49], json!("w49"));
}
