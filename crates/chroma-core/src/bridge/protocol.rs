//! Reserved bridge keys and their payloads
//!
//! Keys under `__chroma/` are answered by the background runtime itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Liveness check, answered with `Pong`
pub const PING: &str = "__chroma/ping";
/// Read a store: `StoreRequest` -> `StoreSnapshot`
pub const STORE_GET: &str = "__chroma/store/get";
/// Merge into a store: `StoreSetRequest` -> `StoreSnapshot`
pub const STORE_SET: &str = "__chroma/store/set";
/// Reset a store: `StoreRequest` -> `StoreSnapshot`
pub const STORE_RESET: &str = "__chroma/store/reset";
/// Broadcast after every commit: `StoreChanged`
pub const STORE_CHANGED: &str = "__chroma/store/changed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub pong: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub store: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSetRequest {
    pub store: String,
    pub partial: Value,
}

/// A store's state as served to UI contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub state: Value,
    pub ready: bool,
    /// Set while the store cannot reach durable storage
    pub degraded: bool,
    /// Opening of the store the version counts in
    pub epoch: Uuid,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreChanged {
    pub store: String,
    pub state: Value,
    pub epoch: Uuid,
    pub version: u64,
}
