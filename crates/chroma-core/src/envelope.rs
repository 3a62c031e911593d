//! Bridge Envelope Types
//!
//! Every unit of bridge traffic is a `MessageEnvelope`. A request envelope is
//! answered by exactly one response or error envelope carrying the same
//! correlation id; broadcast envelopes are one-way notifications from the
//! background context to UI contexts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BridgeError, DispatchError};
use crate::types::{CorrelationId, MessageKey};

// ----------------------------------------------------------------------------
// Envelope Kind
// ----------------------------------------------------------------------------

/// Discriminant of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Response,
    Error,
    Broadcast,
}

// ----------------------------------------------------------------------------
// Remote Error
// ----------------------------------------------------------------------------

/// Why the background rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    NoHandler,
    Handler,
}

/// Payload of an error envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl From<&DispatchError> for RemoteError {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::NoHandler { .. } => RemoteError {
                kind: RemoteErrorKind::NoHandler,
                message: err.to_string(),
            },
            DispatchError::Handler { message, .. } => RemoteError {
                kind: RemoteErrorKind::Handler,
                message: message.clone(),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Message Envelope
// ----------------------------------------------------------------------------

/// A unit of bridge traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: CorrelationId,
    pub key: MessageKey,
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: Value,
}

impl MessageEnvelope {
    /// Create a request envelope with a fresh correlation id
    pub fn request(key: impl Into<MessageKey>, payload: Value) -> Self {
        Self {
            id: CorrelationId::new(),
            key: key.into(),
            kind: EnvelopeKind::Request,
            payload,
        }
    }

    /// Create a one-way broadcast envelope
    pub fn broadcast(key: impl Into<MessageKey>, payload: Value) -> Self {
        Self {
            id: CorrelationId::new(),
            key: key.into(),
            kind: EnvelopeKind::Broadcast,
            payload,
        }
    }

    /// Build the success reply to this request
    pub fn respond(&self, payload: Value) -> Self {
        Self {
            id: self.id,
            key: self.key.clone(),
            kind: EnvelopeKind::Response,
            payload,
        }
    }

    /// Build the error reply to this request
    pub fn fail(&self, err: &DispatchError) -> Self {
        let body = RemoteError::from(err);
        Self {
            id: self.id,
            key: self.key.clone(),
            kind: EnvelopeKind::Error,
            payload: serde_json::to_value(body).unwrap_or(Value::Null),
        }
    }

    /// Build the reply for a dispatch outcome
    pub fn reply(&self, outcome: &Result<Value, DispatchError>) -> Self {
        match outcome {
            Ok(value) => self.respond(value.clone()),
            Err(err) => self.fail(err),
        }
    }

    /// Whether this envelope answers a pending request
    pub fn is_reply(&self) -> bool {
        matches!(self.kind, EnvelopeKind::Response | EnvelopeKind::Error)
    }

    /// Convert a reply envelope into the caller-visible result
    pub fn into_result(self) -> Result<Value, BridgeError> {
        match self.kind {
            EnvelopeKind::Response => Ok(self.payload),
            EnvelopeKind::Error => {
                let key = self.key.to_string();
                match serde_json::from_value::<RemoteError>(self.payload) {
                    Ok(RemoteError {
                        kind: RemoteErrorKind::NoHandler,
                        ..
                    }) => Err(BridgeError::NoHandler { key }),
                    Ok(RemoteError {
                        kind: RemoteErrorKind::Handler,
                        message,
                    }) => Err(BridgeError::Handler { key, message }),
                    Err(e) => Err(BridgeError::Handler {
                        key,
                        message: format!("malformed error envelope: {}", e),
                    }),
                }
            }
            EnvelopeKind::Request | EnvelopeKind::Broadcast => Err(BridgeError::Serialization(
                format!("envelope for '{}' is not a reply", self.key),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
