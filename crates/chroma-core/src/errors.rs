//! Error types for the Chroma framework
//!
//! This module contains all error types used throughout the core and the
//! background runtime: service resolution, dispatch, bridge transport,
//! persistence, scheduling and configuration errors, plus the `ChromaError`
//! type that unifies them all.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures while building the service graph. Fatal to container startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("Cyclic service dependency: {}", cycle.join(" -> "))]
    Cyclic { cycle: Vec<String> },
    #[error("Unknown service: {service}")]
    UnknownService { service: String },
    #[error("Service {service} did not declare {dependency} as a dependency")]
    UndeclaredDependency { service: String, dependency: String },
    #[error("Failed to construct service {service}: {reason}")]
    Construction { service: String, reason: String },
    #[error("Boot hook of service {service} failed: {reason}")]
    BootFailed { service: String, reason: String },
    #[error("Container was dropped before {service} could be resolved")]
    ContainerDropped { service: String },
}

/// Failures of a single dispatched request on the background side
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("No handler registered for '{key}'")]
    NoHandler { key: String },
    #[error("Handler for '{key}' failed: {message}")]
    Handler { key: String, message: String },
}

impl DispatchError {
    /// The message key the failed request was addressed to
    pub fn key(&self) -> &str {
        match self {
            DispatchError::NoHandler { key } | DispatchError::Handler { key, .. } => key,
        }
    }
}

/// Failures surfaced to a UI context by `BridgeClient::send`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("No handler registered for '{key}'")]
    NoHandler { key: String },
    #[error("Handler for '{key}' failed: {message}")]
    Handler { key: String, message: String },
    #[error("Could not reach the background context for '{key}' after {attempts} attempts: {reason}")]
    Connection {
        key: String,
        attempts: u32,
        reason: String,
    },
    #[error("Request '{key}' timed out after {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },
    #[error("Payload serialization failed: {0}")]
    Serialization(String),
    #[error("Bridge client is closed")]
    Closed,
}

/// Coarse classification of a rejected request, for rendering distinct UI states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Nobody answers this key: the action should be disabled
    NoHandler,
    /// The handler ran and failed
    Handler,
    /// The background context could not be reached or did not answer
    Unreachable,
    /// A local encoding problem or a closed client
    Local,
}

impl BridgeError {
    /// Classify this error for the presentation layer
    pub fn kind(&self) -> FailureKind {
        match self {
            BridgeError::NoHandler { .. } => FailureKind::NoHandler,
            BridgeError::Handler { .. } => FailureKind::Handler,
            BridgeError::Connection { .. } | BridgeError::Timeout { .. } => {
                FailureKind::Unreachable
            }
            BridgeError::Serialization(_) | BridgeError::Closed => FailureKind::Local,
        }
    }

    /// Whether retrying at a higher level may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), FailureKind::Unreachable)
    }
}

impl From<DispatchError> for BridgeError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NoHandler { key } => BridgeError::NoHandler { key },
            DispatchError::Handler { key, message } => BridgeError::Handler { key, message },
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

/// Rejected registrations of handlers, jobs, stores and services
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("A handler is already registered for '{key}'")]
    DuplicateHandler { key: String },
    #[error("Key '{key}' uses the reserved prefix")]
    ReservedKey { key: String },
    #[error("A job named '{name}' is already registered")]
    DuplicateJob { name: String },
    #[error("A store named '{name}' is already registered")]
    DuplicateStore { name: String },
    #[error("Service {service} is already registered")]
    DuplicateService { service: String },
}

/// Durable storage failures. Recoverable: the store keeps running in memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("Storage is not available")]
    Unavailable,
    #[error("Failed to read '{key}': {reason}")]
    Read { key: String, reason: String },
    #[error("Failed to write '{key}': {reason}")]
    Write { key: String, reason: String },
    #[error("Snapshot encoding error: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Encoding(err.to_string())
    }
}

/// Rejected store operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Partial update does not fit store '{store}': {reason}")]
    InvalidPartial { store: String, reason: String },
    #[error("Unknown store: {name}")]
    UnknownStore { name: String },
    #[error("Snapshot of store '{store}' could not be encoded: {reason}")]
    Encoding { store: String, reason: String },
}

/// Job scheduler failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("Unknown job: {name}")]
    UnknownJob { name: String },
}

/// Configuration loading and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Top-level error type for the Chroma framework
#[derive(Debug, Error)]
pub enum ChromaError {
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ChromaError {
    /// Whether the error aborts startup rather than a single operation
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChromaError::Resolution(_) | ChromaError::Config(_))
    }
}

/// Result type alias using `ChromaError`
pub type ChromaResult<T> = core::result::Result<T, ChromaError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_lists_path() {
        let err = ResolutionError::Cyclic {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "Cyclic service dependency: A -> B -> A");
    }

    #[test]
    fn test_dispatch_error_maps_to_bridge_error() {
        let err: BridgeError = DispatchError::NoHandler {
            key: "GetBalance".into(),
        }
        .into();
        assert_eq!(
            err,
            BridgeError::NoHandler {
                key: "GetBalance".into()
            }
        );
        assert_eq!(err.kind(), FailureKind::NoHandler);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_failure_kinds_are_distinct() {
        let handler = BridgeError::Handler {
            key: "k".into(),
            message: "boom".into(),
        };
        let unreachable = BridgeError::Connection {
            key: "k".into(),
            attempts: 3,
            reason: "no receiver".into(),
        };
        let timeout = BridgeError::Timeout {
            key: "k".into(),
            timeout_ms: 10,
        };
        assert_eq!(handler.kind(), FailureKind::Handler);
        assert_eq!(unreachable.kind(), FailureKind::Unreachable);
        assert_eq!(timeout.kind(), FailureKind::Unreachable);
        assert!(timeout.is_recoverable());
    }

    #[test]
    fn test_resolution_errors_are_fatal() {
        let err: ChromaError = ResolutionError::UnknownService {
            service: "Wallet".into(),
        }
        .into();
        assert!(err.is_fatal());

        let err: ChromaError = PersistenceError::Unavailable.into();
        assert!(!err.is_fatal());
    }
}
