//! Centralized Configuration Management
//!
//! This module consolidates all configuration structures used throughout
//! Chroma to provide a unified, consistent configuration interface. Every
//! field has a default so a partial TOML file is always valid input.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

// ----------------------------------------------------------------------------
// Bridge Configuration
// ----------------------------------------------------------------------------

/// Retry, timeout and buffering policy of the bridge transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Total delivery attempts before a request fails with a connection error
    pub max_retries: u32,
    /// Fixed delay between delivery attempts
    pub retry_after_ms: u64,
    /// How long a delivered request may wait for its reply
    pub request_timeout_ms: u64,
    /// Buffer size of each UI context's inbox
    pub inbox_buffer_size: usize,
    /// Interval of the optional liveness ping
    pub heartbeat_interval_ms: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,              // Background wake-up usually takes a few attempts
            retry_after_ms: 100,         // Fixed backoff between attempts
            request_timeout_ms: 10_000,  // Handlers may do network I/O
            inbox_buffer_size: 64,       // Replies plus store broadcasts
            heartbeat_interval_ms: None, // Status only refreshed by real traffic
        }
    }
}

impl BridgeConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            max_retries: 3,
            retry_after_ms: 10,
            request_timeout_ms: 500,
            inbox_buffer_size: 100,
            heartbeat_interval_ms: None,
        }
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }

    /// Number of delivery attempts, never less than one
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

// ----------------------------------------------------------------------------
// Store Configuration
// ----------------------------------------------------------------------------

/// Persistence behavior of central stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefix of the storage key a store's snapshot lives under
    pub key_prefix: String,
    /// Whether stores mirror their snapshots to durable storage at all
    pub persist: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "chroma:store:".to_string(),
            persist: true,
        }
    }
}

impl StoreConfig {
    /// Storage key for the store named `name`
    pub fn storage_key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

// ----------------------------------------------------------------------------
// Scheduler Configuration
// ----------------------------------------------------------------------------

/// Job scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether registered jobs are started at all
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ----------------------------------------------------------------------------
// Storage Configuration
// ----------------------------------------------------------------------------

/// Which storage backend the host provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    File,
}

/// Storage backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Document path for the file backend
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("chroma-storage.json"),
        }
    }
}

// ----------------------------------------------------------------------------
// App Manifest Configuration
// ----------------------------------------------------------------------------

/// A job as declared in the application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDeclaration {
    pub name: String,
    pub schedule: String,
}

/// Declared application surface, statically inspected for permissions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppManifestConfig {
    pub name: String,
    pub stores: Vec<String>,
    pub jobs: Vec<JobDeclaration>,
}

// ----------------------------------------------------------------------------
// Unified Configuration
// ----------------------------------------------------------------------------

/// Complete Chroma configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromaConfig {
    pub bridge: BridgeConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub app: AppManifestConfig,
}

impl ChromaConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            bridge: BridgeConfig::testing(),
            ..Self::default()
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "bridge.request_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.bridge.inbox_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "bridge.inbox_buffer_size must be > 0".to_string(),
            ));
        }
        if self.bridge.heartbeat_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "bridge.heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.store.key_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "store.key_prefix must not be empty".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::File
            && self.storage.path.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid(
                "storage.path is required for the file backend".to_string(),
            ));
        }

        let mut stores = self.app.stores.clone();
        stores.sort();
        if stores.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid(
                "app.stores contains duplicate names".to_string(),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
