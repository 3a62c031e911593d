//! Handler Registry
//!
//! Maps message keys to the handlers that answer them. Dispatch looks the
//! key up, runs the handler and converts every failure (an error return, a
//! malformed payload or a panic) into a `DispatchError` for the caller.
//!
//! Registering a key twice is rejected: a key has exactly one handler for
//! the lifetime of a registry.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chroma_core::{DispatchError, MessageKey, RegistrationError};
use dashmap::DashMap;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

// ----------------------------------------------------------------------------
// Handler Trait
// ----------------------------------------------------------------------------

/// Answers requests for one message key
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: Value) -> anyhow::Result<Value>;
}

/// Handler backed by an async closure
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        (self.0)(payload).await
    }
}

// ----------------------------------------------------------------------------
// Handler Registry
// ----------------------------------------------------------------------------

/// Message key to handler table of one background context
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `key`
    ///
    /// Fails if the key is already taken or uses the reserved prefix.
    pub fn register(
        &self,
        key: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistrationError> {
        let key = key.into();
        if MessageKey::new(key.as_str()).is_reserved() {
            return Err(RegistrationError::ReservedKey { key });
        }
        self.insert(key, handler)
    }

    /// Register a handler for a key under the reserved prefix
    pub(crate) fn register_reserved(
        &self,
        key: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistrationError> {
        self.insert(key.to_string(), handler)
    }

    fn insert(&self, key: String, handler: Arc<dyn Handler>) -> Result<(), RegistrationError> {
        match self.handlers.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(RegistrationError::DuplicateHandler {
                    key: entry.key().clone(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                debug!("Registered handler for '{}'", entry.key());
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Register an async closure over raw JSON payloads
    pub fn register_fn<F, Fut>(&self, key: impl Into<String>, f: F) -> Result<(), RegistrationError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(key, Arc::new(FnHandler::new(f)))
    }

    /// Register a synchronous closure over raw JSON payloads
    pub fn register_sync<F>(&self, key: impl Into<String>, f: F) -> Result<(), RegistrationError>
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register_fn(key, move |payload| std::future::ready(f(payload)))
    }

    /// Bind `key` to a method of a service instance
    ///
    /// The payload is decoded into `Req` before the method runs; a payload
    /// that does not decode fails the request as a handler error.
    pub fn register_method<S, Req, Res, F, Fut>(
        &self,
        key: impl Into<String>,
        service: Arc<S>,
        method: F,
    ) -> Result<(), RegistrationError>
    where
        S: Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Arc<S>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Res>> + Send + 'static,
    {
        self.register(key, method_handler(service, method))
    }

    /// Run the handler registered for `key`
    pub async fn dispatch(&self, key: &str, payload: Value) -> Result<Value, DispatchError> {
        // Clone out of the map so no shard lock is held across the await.
        let handler = match self.handlers.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                warn!("No handler registered for '{}'", key);
                return Err(DispatchError::NoHandler {
                    key: key.to_string(),
                });
            }
        };

        let outcome = AssertUnwindSafe(handler.handle(payload))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("Handler for '{}' failed: {:#}", key, e);
                Err(DispatchError::Handler {
                    key: key.to_string(),
                    message: format!("{:#}", e),
                })
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("Handler for '{}' panicked: {}", key, message);
                Err(DispatchError::Handler {
                    key: key.to_string(),
                    message: format!("handler panicked: {}", message),
                })
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    /// Registered keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

/// Wrap a service method as a JSON handler
pub fn method_handler<S, Req, Res, F, Fut>(service: Arc<S>, method: F) -> Arc<dyn Handler>
where
    S: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Arc<S>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Res>> + Send + 'static,
{
    Arc::new(FnHandler::new(move |payload: Value| {
        let call = serde_json::from_value::<Req>(payload).map(|request| {
            let service = Arc::clone(&service);
            method(service, request)
        });
        async move {
            let response = call.context("malformed payload")?.await?;
            Ok(serde_json::to_value(response)?)
        }
    }))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
