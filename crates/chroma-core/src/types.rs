//! Core types for the Chroma framework
//!
//! This module defines the small value types shared by every component:
//! correlation identifiers, message keys, connection status and the clock
//! abstraction used by the scheduler.

use core::fmt;
use core::ops::Deref;
use core::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Correlation Identifier
// ----------------------------------------------------------------------------

/// Unique identifier pairing a request envelope with its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ----------------------------------------------------------------------------
// Message Key
// ----------------------------------------------------------------------------

/// Prefix of keys answered by the runtime itself
pub const RESERVED_PREFIX: &str = "__chroma/";

/// String key a request is addressed to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKey(String);

impl MessageKey {
    /// Create a message key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key belongs to the runtime's reserved namespace
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with(RESERVED_PREFIX)
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for MessageKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for MessageKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for MessageKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

// ----------------------------------------------------------------------------
// Connection Status
// ----------------------------------------------------------------------------

/// Bridge connection status as seen from a UI context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Connecting => write!(f, "Connecting"),
            ConnectionStatus::Connected => write!(f, "Connected"),
        }
    }
}

// ----------------------------------------------------------------------------
// Clock
// ----------------------------------------------------------------------------

/// Wall-clock source for schedule evaluation
///
/// The scheduler only ever asks for "now" and sleeps with tokio timers, so a
/// clock anchored to tokio's time lets tests drive cron schedules under
/// paused time.
pub trait Clock: Send + Sync + 'static {
    /// Get the current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that advances with tokio's (possibly paused) timer
///
/// `now()` is the anchor plus the tokio time elapsed since construction.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    anchor: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl VirtualClock {
    /// Create a virtual clock starting at `anchor`
    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.started);
        match chrono::Duration::from_std(elapsed) {
            Ok(elapsed) => self.anchor + elapsed,
            Err(_) => self.anchor,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
