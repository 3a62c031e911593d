//! Chroma Runtime Engine
//!
//! This crate contains the engine of the background context:
//! - `Container`: service graph resolution with singleton scope and boot hooks
//! - `HandlerRegistry`: message key to handler dispatch
//! - `Scheduler`: cron jobs with pause/resume
//! - `BackgroundServer`: answers bridge requests posted by UI contexts
//! - `AppBuilder` / `BackgroundHandle`: assembly and lifecycle of the above
//!
//! `chroma-core` provides the data model, the central store and the UI-side
//! bridge client these build on.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chroma_core::{LocalHost, Store};
//! use chroma_runtime::{AppBuilder, Service, ServiceDescriptor};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Default, Serialize, Deserialize)]
//! struct Wallets {
//!     wallets: Vec<String>,
//! }
//!
//! struct WalletService {
//!     store: Arc<Store<Wallets>>,
//! }
//!
//! impl Service for WalletService {}
//!
//! #[derive(Deserialize)]
//! struct AddWallet {
//!     address: String,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let host = LocalHost::default();
//! let mut app = AppBuilder::new()
//!     .store("wallet", Wallets::default())
//!     .service(
//!         ServiceDescriptor::new(|deps| {
//!             Ok(WalletService {
//!                 store: deps.get::<Store<Wallets>>()?,
//!             })
//!         })
//!         .imports::<Store<Wallets>>()
//!         .handler("AddWallet", |service: Arc<WalletService>, req: AddWallet| async move {
//!             service.store.update(|state| state.wallets.push(req.address));
//!             Ok(service.store.get_state().wallets.len())
//!         }),
//!     )
//!     .build(&host)
//!     .await?;
//!
//! app.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod builder;
pub mod container;
pub mod registry;
pub mod scheduler;

pub use background::BackgroundServer;
pub use builder::{AppBuilder, BackgroundHandle};
pub use container::{
    short_type_name, Container, Dependencies, Lazy, Service, ServiceBuilder, ServiceDescriptor,
};
pub use registry::{method_handler, FnHandler, Handler, HandlerRegistry};
pub use scheduler::{parse_schedule, upcoming, FnJob, Job, JobContext, JobDescriptor, Scheduler};

// Re-export core types for convenience
pub use chroma_core::{
    BridgeClient, BridgeConfig, BridgeError, ChromaConfig, ChromaError, ChromaResult,
    DispatchError, LocalHost, RegistrationError, RemoteStore, ResolutionError, SchedulerError,
    Store, StoreHealth, StoreRegistry,
};
