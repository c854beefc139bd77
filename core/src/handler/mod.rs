//! Handlers - named I/O capabilities bound to nodes
//!
//! A handler wraps one external capability (state store, cache, message
//! producer, vector store, ...) behind a declared protocol. Handlers are
//! registered once at boot; each one gets its own circuit breaker which is
//! shared by every node bound to it.

pub mod breaker;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::Duration;
use uuid::Uuid;

use crate::config::BreakerSection;
use crate::error::{HostError, Result};
use crate::telemetry::Telemetry;

pub use breaker::{BreakerConfig, BreakerMetrics, CircuitBreaker, CircuitState};

/// Handler-specific settings, taken from `[handlers.<type>]` plus profile overrides
pub type HandlerSettings = Map<String, Value>;

/// Failure reported by a handler implementation
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    /// Whether the host may redeliver the envelope that caused this call
    pub retryable: bool,
}

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            retryable: false,
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            retryable: true,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler error: {}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// One operation on a handler
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerRequest {
    pub operation: String,
    pub payload: Value,
    pub correlation_id: Option<Uuid>,
}

impl HandlerRequest {
    pub fn new(operation: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            payload,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Required string field of the payload
    pub fn str_field(&self, field: &str) -> std::result::Result<&str, HandlerError> {
        self.payload
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new(format!("{}: missing string field '{}'", self.operation, field)))
    }
}

/// Input/output shape of one protocol method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    pub input: String,
    pub output: String,
}

impl MethodSignature {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

/// Named, versioned protocol a handler satisfies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSignature>,
}

impl ProtocolDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn method(mut self, name: impl Into<String>, input: &str, output: &str) -> Self {
        self.methods.insert(name.into(), MethodSignature::new(input, output));
        self
    }

    /// Whether this protocol satisfies a contract declaration
    ///
    /// A declaration is either the bare protocol name or `name@<major>`.
    pub fn satisfies(&self, declared: &str) -> bool {
        match declared.split_once('@') {
            None => declared == self.name,
            Some((name, major)) => {
                name == self.name && self.version.split('.').next() == Some(major)
            }
        }
    }
}

/// Capability implementation
///
/// Implementations must be safe to call concurrently. `initialize` may be
/// called more than once and must be idempotent; the registry additionally
/// guarantees it runs at most once per registration.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Capability name this handler is registered under
    fn handler_type(&self) -> &str;

    fn protocol(&self) -> ProtocolDescriptor;

    async fn initialize(&self, _settings: &HandlerSettings) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    async fn call(&self, request: HandlerRequest) -> std::result::Result<Value, HandlerError>;

    async fn shutdown(&self) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

/// A registered handler guarded by its breaker
pub struct BoundHandler {
    handler: Arc<dyn Handler>,
    protocol: ProtocolDescriptor,
    breaker: CircuitBreaker,
    initialized: OnceCell<()>,
}

impl fmt::Debug for BoundHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundHandler")
            .field("handler_type", &self.handler.handler_type())
            .field("protocol", &self.protocol.name)
            .field("state", &self.breaker.state())
            .finish()
    }
}

impl BoundHandler {
    pub fn handler_type(&self) -> &str {
        self.handler.handler_type()
    }

    pub fn protocol(&self) -> &ProtocolDescriptor {
        &self.protocol
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Initialize once; later calls return immediately
    pub async fn initialize(&self, settings: &HandlerSettings) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                tracing::debug!(handler_type = %self.handler_type(), "initializing handler");
                self.handler.initialize(settings).await.map_err(|e| HostError::HandlerFailed {
                    handler_type: self.handler_type().to_string(),
                    operation: "initialize".to_string(),
                    message: e.message,
                    retryable: e.retryable,
                })
            })
            .await
            .map(|_| ())
    }

    /// Call through the breaker with a time budget
    ///
    /// Timeouts count as failures. A rejected call never reaches the handler.
    pub async fn call(&self, request: HandlerRequest, timeout: Duration) -> Result<Value> {
        self.breaker.try_acquire()?;
        let operation = request.operation.clone();

        match tokio::time::timeout(timeout, self.handler.call(request)).await {
            Ok(Ok(value)) => {
                self.breaker.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                Err(HostError::HandlerFailed {
                    handler_type: self.handler_type().to_string(),
                    operation,
                    message: e.message,
                    retryable: e.retryable,
                })
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(HostError::HandlerTimeout {
                    handler_type: self.handler_type().to_string(),
                    operation,
                    duration: timeout,
                })
            }
        }
    }

    async fn shutdown(&self) -> std::result::Result<(), HandlerError> {
        self.handler.shutdown().await
    }
}

/// Handlers keyed by capability name
///
/// Built bottom-up before any node is bound and never mutated afterwards.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<BoundHandler>>,
    breakers: BreakerSection,
    telemetry: Option<Telemetry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Breaker defaults and per-handler overrides for later registrations
    pub fn with_breakers(mut self, breakers: BreakerSection) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Register a handler under its own `handler_type`
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<()> {
        let handler_type = handler.handler_type().to_string();
        if self.handlers.contains_key(&handler_type) {
            return Err(HostError::InvalidConfig {
                message: format!("handler {} registered twice", handler_type),
            });
        }

        let mut breaker = CircuitBreaker::new(&handler_type, self.breakers.for_handler(&handler_type));
        if let Some(telemetry) = &self.telemetry {
            breaker = breaker.with_telemetry(telemetry.clone());
        }

        let bound = BoundHandler {
            protocol: handler.protocol(),
            handler,
            breaker,
            initialized: OnceCell::new(),
        };
        tracing::debug!(%handler_type, protocol = %bound.protocol.name, "registered handler");
        self.handlers.insert(handler_type, Arc::new(bound));
        Ok(())
    }

    pub fn resolve(&self, handler_type: &str) -> Option<Arc<BoundHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn require(&self, handler_type: &str) -> Result<Arc<BoundHandler>> {
        self.resolve(handler_type).ok_or_else(|| HostError::HandlerNotFound {
            handler_type: handler_type.to_string(),
        })
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    pub fn handler_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Initialize every handler with its settings, in name order
    pub async fn initialize_all<F>(&self, settings_for: F) -> Result<()>
    where
        F: Fn(&str) -> HandlerSettings,
    {
        for (handler_type, bound) in &self.handlers {
            bound.initialize(&settings_for(handler_type)).await?;
        }
        Ok(())
    }

    /// Shut every handler down; failures are logged, not returned
    pub async fn shutdown_all(&self) {
        for (handler_type, bound) in &self.handlers {
            if let Err(e) = bound.shutdown().await {
                tracing::warn!(%handler_type, error = %e, "handler shutdown failed");
            }
        }
    }

    /// Protocols keyed by protocol name
    pub fn protocols(&self) -> BTreeMap<String, ProtocolDescriptor> {
        self.handlers
            .values()
            .map(|h| (h.protocol.name.clone(), h.protocol.clone()))
            .collect()
    }

    pub fn breaker_metrics(&self) -> BTreeMap<String, BreakerMetrics> {
        self.handlers
            .iter()
            .map(|(name, h)| (name.clone(), h.breaker.metrics()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Handler with scripted behaviour for tests
    pub struct ScriptedHandler {
        pub handler_type: String,
        pub protocol: String,
        pub calls: AtomicU32,
        pub inits: AtomicU32,
        pub failing: AtomicBool,
        pub delay: Option<Duration>,
    }

    impl ScriptedHandler {
        pub fn new(handler_type: &str, protocol: &str) -> Self {
            Self {
                handler_type: handler_type.to_string(),
                protocol: protocol.to_string(),
                calls: AtomicU32::new(0),
                inits: AtomicU32::new(0),
                failing: AtomicBool::new(false),
                delay: None,
            }
        }

        pub fn failing(self) -> Self {
            self.failing.store(true, Ordering::SeqCst);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Handler for ScriptedHandler {
        fn handler_type(&self) -> &str {
            &self.handler_type
        }

        fn protocol(&self) -> ProtocolDescriptor {
            ProtocolDescriptor::new(&self.protocol, "1.0.0").method("echo", "Value", "Value")
        }

        async fn initialize(&self, _settings: &HandlerSettings) -> std::result::Result<(), HandlerError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn call(&self, request: HandlerRequest) -> std::result::Result<Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(HandlerError::new("scripted failure"));
            }
            Ok(request.payload)
        }
    }
}
