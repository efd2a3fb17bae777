//! Capability handlers and the per-service lookup table.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};

use courier_core::{CapabilityResult, MessageKind};

/// Validated payload handed to a handler.
pub type Payload = Map<String, JsonValue>;

/// Performs the work behind one or more message kinds.
///
/// Handlers receive payloads that already passed schema validation and return
/// the value placed under `data.response` in the reply. Any error becomes an
/// `error` reply; the worker never lets a handler failure escape.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn handle(&self, kind: MessageKind, payload: Payload) -> CapabilityResult<JsonValue>;
}

/// Adapter turning an async closure into a [`CapabilityHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(MessageKind, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CapabilityResult<JsonValue>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F, Fut>
where
    F: Fn(MessageKind, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CapabilityResult<JsonValue>> + Send + 'static,
{
    async fn handle(&self, kind: MessageKind, payload: Payload) -> CapabilityResult<JsonValue> {
        (self.f)(kind, payload).await
    }
}

/// Kind → handler table for a worker.
///
/// `ping` is answered out of the box; every other kind must be registered.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, Arc<dyn CapabilityHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register_fn(MessageKind::Ping, |_, _| async {
            Ok(JsonValue::String("pong".to_string()))
        });
        registry
    }

    /// Register (or replace) the handler for a kind.
    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn CapabilityHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, kind: MessageKind, f: F) -> &mut Self
    where
        F: Fn(MessageKind, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CapabilityResult<JsonValue>> + Send + 'static,
    {
        self.register(kind, Arc::new(handler_fn(f)))
    }

    pub fn get(&self, kind: MessageKind) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<MessageKind> {
        MessageKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}
