//! Chroma Core
//!
//! Foundational types for the Chroma extension framework: the bridge
//! envelope and client used by UI contexts, the central store owned by the
//! background context, host capabilities (durable storage and messaging),
//! configuration and the error taxonomy shared by every crate.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod bridge;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod manifest;
pub mod storage;
pub mod store;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use bridge::{BridgeClient, LocalHost, Port, PortError, RemoteStore};
pub use config::{
    AppManifestConfig, BridgeConfig, ChromaConfig, JobDeclaration, SchedulerConfig,
    StorageBackend, StorageConfig, StoreConfig,
};
pub use envelope::{EnvelopeKind, MessageEnvelope, RemoteError, RemoteErrorKind};
pub use errors::{
    BridgeError, ChromaError, ChromaResult, ConfigError, DispatchError, FailureKind,
    PersistenceError, RegistrationError, ResolutionError, SchedulerError, StoreError,
};
pub use manifest::{required_permissions, Permission};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage, SharedStorage, StorageMap};
pub use store::{ErasedStore, Store, StoreHealth, StoreRegistry, StoreState, Subscription};
pub use types::{
    Clock, ConnectionStatus, CorrelationId, MessageKey, SharedClock, SystemClock, VirtualClock,
    RESERVED_PREFIX,
};
