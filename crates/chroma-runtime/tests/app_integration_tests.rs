//! Integration Tests for the Background Context
//!
//! Builds complete background contexts on an in-process host and talks to
//! them the way a UI context does: through a `BridgeClient` and
//! `RemoteStore`s. Restarts are simulated by shutting a context down and
//! building a new one against the same storage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use chroma_core::{
    BridgeClient, BridgeConfig, BridgeError, ChromaConfig, ChromaError, ConnectionStatus,
    FailureKind, LocalHost, MemoryStorage, RemoteStore, ResolutionError, SharedStorage, Store,
    StoreHealth, VirtualClock,
};
use chroma_runtime::{
    AppBuilder, BackgroundHandle, JobContext, Scheduler, Service, ServiceDescriptor,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::timeout;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct WalletState {
    wallets: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AddWallet {
    address: String,
}

struct WalletService {
    store: Arc<Store<WalletState>>,
}

impl Service for WalletService {}

impl WalletService {
    async fn add_wallet(&self, request: AddWallet) -> anyhow::Result<usize> {
        if request.address.is_empty() {
            anyhow::bail!("address must not be empty");
        }
        self.store.ready().await;
        self.store
            .update(move |state| state.wallets.push(request.address));
        Ok(self.store.get_state().wallets.len())
    }
}

fn wallet_service() -> ServiceDescriptor {
    ServiceDescriptor::new(|deps| {
        Ok(WalletService {
            store: deps.get::<Store<WalletState>>()?,
        })
    })
    .imports::<Store<WalletState>>()
    .handler(
        "AddWallet",
        |service: Arc<WalletService>, request: AddWallet| async move {
            service.add_wallet(request).await
        },
    )
    .build()
}

async fn start_wallet_app(host: &LocalHost, storage: SharedStorage) -> BackgroundHandle {
    AppBuilder::new()
        .with_config(ChromaConfig::testing())
        .with_storage(storage)
        .store("wallet", WalletState::default())
        .service(wallet_service())
        .build(host)
        .await
        .expect("background context should start")
}

fn patient_bridge() -> BridgeConfig {
    BridgeConfig {
        max_retries: 50,
        retry_after_ms: 20,
        ..BridgeConfig::testing()
    }
}

// ----------------------------------------------------------------------------
// Dispatch Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_get_balance_without_handler_is_rejected() {
    let host = LocalHost::default();
    let mut app = start_wallet_app(&host, Arc::new(MemoryStorage::new())).await;
    let client = BridgeClient::connect(&host, BridgeConfig::testing());

    let err = client
        .send::<_, Value>("GetBalance", &json!({"address": "X"}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::NoHandler {
            key: "GetBalance".into()
        }
    );
    assert_eq!(err.kind(), FailureKind::NoHandler);

    app.shutdown().await;
}

#[tokio::test]
async fn test_handler_failure_is_distinguishable() {
    let host = LocalHost::default();
    let mut app = start_wallet_app(&host, Arc::new(MemoryStorage::new())).await;
    let client = BridgeClient::connect(&host, BridgeConfig::testing());

    let count: usize = client
        .send("AddWallet", &json!({"address": "w"}))
        .await
        .unwrap();
    assert_eq!(count, 1);

    let err = client
        .send::<_, usize>("AddWallet", &json!({"address": ""}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::Handler {
            key: "AddWallet".into(),
            message: "address must not be empty".into()
        }
    );
    assert_eq!(err.kind(), FailureKind::Handler);
    assert_eq!(client.pending_count(), 0);

    app.shutdown().await;
}

// ----------------------------------------------------------------------------
// Bridge Retry Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_send_succeeds_once_background_starts() {
    let host = LocalHost::default();
    let client = BridgeClient::connect(&host, patient_bridge());

    let request = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send::<_, usize>("AddWallet", &json!({"address": "late"}))
                .await
        })
    };

    // Several attempts fail before the background context exists
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.status(), ConnectionStatus::Connecting);
    let mut app = start_wallet_app(&host, Arc::new(MemoryStorage::new())).await;

    let count = timeout(Duration::from_secs(2), request)
        .await
        .expect("request should complete")
        .expect("request task should not panic")
        .expect("request should succeed");
    assert_eq!(count, 1);
    assert_eq!(client.status(), ConnectionStatus::Connected);

    app.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_surface_one_connection_error() {
    let host = LocalHost::default();
    let config = BridgeConfig {
        max_retries: 4,
        retry_after_ms: 5,
        ..BridgeConfig::testing()
    };
    let client = BridgeClient::connect(&host, config);

    let err = client
        .send::<_, Value>("AddWallet", &json!({"address": "w"}))
        .await
        .unwrap_err();
    match err {
        BridgeError::Connection { key, attempts, .. } => {
            assert_eq!(key, "AddWallet");
            assert_eq!(attempts, 4);
        }
        other => panic!("expected a connection error, got {:?}", other),
    }
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_client_survives_background_restart() {
    let host = LocalHost::default();
    let storage: SharedStorage = Arc::new(MemoryStorage::new());
    let client = BridgeClient::connect(&host, patient_bridge());

    let mut first = start_wallet_app(&host, Arc::clone(&storage)).await;
    let count: usize = client
        .send("AddWallet", &json!({"address": "a"}))
        .await
        .unwrap();
    assert_eq!(count, 1);
    first.shutdown().await;
    assert!(!host.is_background_attached());

    let mut second = start_wallet_app(&host, Arc::clone(&storage)).await;
    second.stores().ready_all().await;
    let count: usize = client
        .send("AddWallet", &json!({"address": "b"}))
        .await
        .unwrap();
    assert_eq!(count, 2);
    second.shutdown().await;
}

// ----------------------------------------------------------------------------
// Store Replication Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_wallet_store_survives_crash_and_reload() {
    let host = LocalHost::default();
    let storage = MemoryStorage::new();

    {
        let app = start_wallet_app(&host, Arc::new(storage.clone())).await;
        let store = app.store::<WalletState>().unwrap();
        store.ready().await;
        store.set_state(json!({"wallets": ["w"]})).unwrap();
        store.flush().await;
        // Dropped without shutdown, as on a crash
    }
    host.suspend_background();

    let mut app = start_wallet_app(&host, Arc::new(storage.clone())).await;
    let store = app.store::<WalletState>().unwrap();
    timeout(Duration::from_secs(1), store.ready())
        .await
        .expect("store should load");
    assert_eq!(
        store.get_state(),
        WalletState {
            wallets: vec!["w".into()]
        }
    );
    assert_eq!(store.health(), StoreHealth::Durable);
    app.shutdown().await;
}

#[tokio::test]
async fn test_remote_store_follows_background_commits() {
    let host = LocalHost::default();
    let mut app = start_wallet_app(&host, Arc::new(MemoryStorage::new())).await;
    app.stores().ready_all().await;
    let client = BridgeClient::connect(&host, BridgeConfig::testing());

    let remote = RemoteStore::connect(&client, "wallet", WalletState::default())
        .await
        .unwrap();
    assert!(remote.is_ready());
    assert!(!remote.is_degraded());
    assert!(remote.get_state().wallets.is_empty());

    let mut updates = remote.watch();
    let _: usize = client
        .send("AddWallet", &json!({"address": "w"}))
        .await
        .unwrap();
    timeout(
        Duration::from_secs(1),
        updates.wait_for(|state| state.wallets == vec!["w".to_string()]),
    )
    .await
    .expect("broadcast should arrive")
    .unwrap();

    let state = remote.set_state(json!({"wallets": []})).await.unwrap();
    assert!(state.wallets.is_empty());
    let store = app.store::<WalletState>().unwrap();
    assert!(store.get_state().wallets.is_empty());

    app.shutdown().await;
}

#[tokio::test]
async fn test_remote_store_follows_restarted_background() {
    let host = LocalHost::default();
    let storage: SharedStorage = Arc::new(MemoryStorage::new());
    let client = BridgeClient::connect(&host, patient_bridge());

    let mut first = start_wallet_app(&host, Arc::clone(&storage)).await;
    first.stores().ready_all().await;
    let remote = RemoteStore::connect(&client, "wallet", WalletState::default())
        .await
        .unwrap();
    for address in ["a", "b", "c", "d"] {
        remote
            .set_state(json!({ "wallets": [address] }))
            .await
            .unwrap();
    }
    first.store::<WalletState>().unwrap().flush().await;
    first.shutdown().await;

    // The reopened store counts versions from the start again
    let mut second = start_wallet_app(&host, Arc::clone(&storage)).await;
    second.stores().ready_all().await;
    let state = remote
        .set_state(json!({"wallets": ["after-restart"]}))
        .await
        .unwrap();
    assert_eq!(state.wallets, vec!["after-restart".to_string()]);
    assert_eq!(remote.get_state(), state);

    let mut updates = remote.watch();
    let _: usize = client
        .send("AddWallet", &json!({"address": "e"}))
        .await
        .unwrap();
    timeout(
        Duration::from_secs(1),
        updates.wait_for(|state| state.wallets.len() == 2),
    )
    .await
    .expect("broadcast from the new background should be adopted")
    .unwrap();
    assert_eq!(
        second.store::<WalletState>().unwrap().get_state(),
        remote.get_state()
    );

    second.shutdown().await;
}

#[tokio::test]
async fn test_degraded_storage_is_reported_to_ui() {
    let host = LocalHost::default();
    let storage = MemoryStorage::new();
    storage.set_available(false);
    let mut app = start_wallet_app(&host, Arc::new(storage)).await;
    app.stores().ready_all().await;
    let client = BridgeClient::connect(&host, BridgeConfig::testing());

    let remote = RemoteStore::connect(&client, "wallet", WalletState::default())
        .await
        .unwrap();
    assert!(remote.is_ready());
    assert!(remote.is_degraded());

    app.shutdown().await;
}

// ----------------------------------------------------------------------------
// Container Tests
// ----------------------------------------------------------------------------

type BootLog = Arc<Mutex<Vec<&'static str>>>;

struct PriceApi {
    log: BootLog,
}

#[async_trait]
impl Service for PriceApi {
    async fn boot(&self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("PriceApi");
        Ok(())
    }
}

struct Portfolio {
    log: BootLog,
}

#[async_trait]
impl Service for Portfolio {
    async fn boot(&self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("Portfolio");
        Ok(())
    }
}

#[tokio::test]
async fn test_services_boot_after_their_imports() {
    let host = LocalHost::default();
    let log: BootLog = Arc::default();
    let (api_log, portfolio_log) = (Arc::clone(&log), Arc::clone(&log));

    let mut app = AppBuilder::new()
        .with_config(ChromaConfig::testing())
        .service(
            ServiceDescriptor::new(move |deps| {
                deps.get::<PriceApi>()?;
                Ok(Portfolio {
                    log: Arc::clone(&portfolio_log),
                })
            })
            .imports::<PriceApi>(),
        )
        .service(ServiceDescriptor::new(move |_| {
            Ok(PriceApi {
                log: Arc::clone(&api_log),
            })
        }))
        .build(&host)
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["PriceApi", "Portfolio"]);
    let first = app.resolve::<Portfolio>().await.unwrap();
    let second = app.resolve::<Portfolio>().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(log.lock().unwrap().len(), 2);

    app.shutdown().await;
}

struct Left;
impl Service for Left {}
struct Right;
impl Service for Right {}

#[tokio::test]
async fn test_cyclic_imports_abort_startup() {
    let host = LocalHost::default();
    let err = AppBuilder::new()
        .with_config(ChromaConfig::testing())
        .service(ServiceDescriptor::new(|_| Ok(Left)).imports::<Right>())
        .service(ServiceDescriptor::new(|_| Ok(Right)).imports::<Left>())
        .build(&host)
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    match err {
        ChromaError::Resolution(ResolutionError::Cyclic { cycle }) => {
            assert_eq!(cycle, vec!["Left", "Right", "Left"]);
        }
        other => panic!("expected a cyclic dependency error, got {:?}", other),
    }
    assert!(!host.is_background_attached());
}

// ----------------------------------------------------------------------------
// Scheduler Tests
// ----------------------------------------------------------------------------

struct SyncService {
    scheduler: Arc<Scheduler>,
    pause_on_tick: AtomicBool,
}

impl Service for SyncService {}

impl SyncService {
    async fn sync(&self, ctx: JobContext) -> anyhow::Result<()> {
        if self.pause_on_tick.swap(false, Ordering::SeqCst) {
            ctx.pause();
        }
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.scheduler.resume("sync")?;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_paused_job_gets_no_ticks_until_resumed() {
    let host = LocalHost::default();
    let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();

    let mut app = AppBuilder::new()
        .with_config(ChromaConfig::testing())
        .with_clock(Arc::new(VirtualClock::starting_at(anchor)))
        .service(
            ServiceDescriptor::new(|deps| {
                Ok(SyncService {
                    scheduler: deps.get::<Scheduler>()?,
                    pause_on_tick: AtomicBool::new(true),
                })
            })
            .imports::<Scheduler>()
            .job("sync", "* * * * *", |service: Arc<SyncService>, ctx| async move {
                service.sync(ctx).await
            })
            .handler("ResumeSync", |service: Arc<SyncService>, _: Value| async move {
                service.resume().await
            }),
        )
        .build(&host)
        .await
        .unwrap();

    // First tick pauses the job; the following nine minutes pass unticked
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(app.scheduler().tick_count("sync"), Some(1));
    assert_eq!(app.scheduler().is_paused("sync"), Some(true));

    app.dispatch("ResumeSync", Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    assert_eq!(app.scheduler().tick_count("sync"), Some(3));
    assert_eq!(app.scheduler().is_paused("sync"), Some(false));

    app.shutdown().await;
}
