//! Intent routing
//!
//! Carries out the intents returned by reducers and orchestrators. The
//! mapping from intent type to target is static:
//!
//! | intent            | target                          |
//! |-------------------|---------------------------------|
//! | STATE_UPDATE      | handler `intent.target`, upsert |
//! | CACHE_WRITE       | handler `intent.target`, set    |
//! | DATA_FETCH        | handler `intent.target`, fetch  |
//! | EVENT_PUBLISH     | handler `intent.target`, publish|
//! | WORKFLOW_TRIGGER  | orchestrator node, re-entry     |
//! | LOG / METRIC      | tracing / telemetry             |
//!
//! Every intent yields one outcome. A batch is never rolled back.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use uuid::Uuid;

use crate::envelope::{Envelope, NodeInput};
use crate::error::{HostError, Result};
use crate::handler::{HandlerRegistry, HandlerRequest};
use crate::intent::{Intent, IntentType};
use crate::telemetry::Telemetry;

/// Where an intent type is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentRoute {
    Handler { operation: &'static str },
    Orchestrator,
    Observer,
}

impl IntentRoute {
    pub fn for_type(intent_type: IntentType) -> Self {
        match intent_type {
            IntentType::StateUpdate => Self::Handler { operation: "upsert" },
            IntentType::CacheWrite => Self::Handler { operation: "set" },
            IntentType::DataFetch => Self::Handler { operation: "fetch" },
            IntentType::EventPublish => Self::Handler { operation: "publish" },
            IntentType::WorkflowTrigger => Self::Orchestrator,
            IntentType::Log | IntentType::Metric => Self::Observer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntentStatus {
    Executed { result: Value },
    Failed { code: &'static str, error: String },
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentOutcome {
    pub intent_id: Uuid,
    pub intent_type: IntentType,
    pub target: String,
    #[serde(flatten)]
    pub status: IntentStatus,
}

impl IntentOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self.status, IntentStatus::Executed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct IntentRouter {
    handlers: Arc<HandlerRegistry>,
    orchestrators: BTreeSet<String>,
    reentry: mpsc::UnboundedSender<Envelope>,
    call_timeout: Duration,
    telemetry: Telemetry,
}

impl IntentRouter {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        orchestrators: BTreeSet<String>,
        reentry: mpsc::UnboundedSender<Envelope>,
        call_timeout: Duration,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            handlers,
            orchestrators,
            reentry,
            call_timeout,
            telemetry,
        }
    }

    /// Route a batch, highest priority first; equal priorities keep their order
    pub async fn route_batch(&self, mut intents: Vec<Intent>, parent: &NodeInput) -> Vec<IntentOutcome> {
        intents.sort_by(|a, b| b.priority.cmp(&a.priority));
        let mut outcomes = Vec::with_capacity(intents.len());
        for intent in &intents {
            outcomes.push(self.route(intent, parent).await);
        }
        outcomes
    }

    pub async fn route(&self, intent: &Intent, parent: &NodeInput) -> IntentOutcome {
        let outcome = |status| IntentOutcome {
            intent_id: intent.id,
            intent_type: intent.intent_type,
            target: intent.target.clone(),
            status,
        };

        if intent.is_expired(Utc::now()) {
            tracing::warn!(
                intent_id = %intent.id,
                intent_type = %intent.intent_type,
                target = %intent.target,
                "intent expired; dropped"
            );
            self.telemetry.intent_expired(intent.id, intent.intent_type);
            return outcome(IntentStatus::Expired);
        }

        let result = match IntentRoute::for_type(intent.intent_type) {
            IntentRoute::Handler { operation } => self.call_handler(intent, operation).await,
            IntentRoute::Orchestrator => self.trigger_workflow(intent, parent),
            IntentRoute::Observer => Ok(self.observe(intent)),
        };

        let success = result.is_ok();
        self.telemetry
            .intent_routed(intent.id, intent.intent_type, &intent.target, success);
        match result {
            Ok(result) => outcome(IntentStatus::Executed { result }),
            Err(e) => {
                tracing::warn!(
                    intent_id = %intent.id,
                    intent_type = %intent.intent_type,
                    target = %intent.target,
                    error = %e,
                    "intent failed"
                );
                outcome(IntentStatus::Failed {
                    code: e.code(),
                    error: e.to_string(),
                })
            }
        }
    }

    async fn call_handler(&self, intent: &Intent, operation: &str) -> Result<Value> {
        let bound = self.handlers.require(&intent.target)?;
        let request =
            HandlerRequest::new(operation, intent.payload.clone()).with_correlation(intent.correlation_id);
        bound.call(request, self.call_timeout).await
    }

    /// Re-enter the trigger as a new envelope for the orchestrator
    fn trigger_workflow(&self, intent: &Intent, parent: &NodeInput) -> Result<Value> {
        if !self.orchestrators.contains(&intent.target) {
            return Err(HostError::UnknownNode {
                node_id: intent.target.clone(),
            });
        }
        let envelope = parent.child_envelope(intent.id, &intent.target, intent.payload.clone());
        let envelope_id = envelope.envelope_id;
        self.reentry
            .send(envelope)
            .map_err(|_| HostError::SchedulerClosed)?;
        tracing::debug!(%envelope_id, node_id = %intent.target, "workflow trigger re-entered");
        Ok(json!({ "envelope_id": envelope_id }))
    }

    fn observe(&self, intent: &Intent) -> Value {
        match intent.intent_type {
            IntentType::Metric => {
                let name = intent
                    .payload
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(&intent.target);
                let value = intent.payload.get("value").and_then(Value::as_f64).unwrap_or(1.0);
                self.telemetry.metric(name, value);
            }
            _ => {
                let message = intent
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("intent log");
                let correlation_id = intent.correlation_id;
                match intent.payload.get("level").and_then(Value::as_str) {
                    Some("error") => tracing::error!(%correlation_id, data = %intent.payload, "{}", message),
                    Some("warn") => tracing::warn!(%correlation_id, data = %intent.payload, "{}", message),
                    Some("debug") => tracing::debug!(%correlation_id, data = %intent.payload, "{}", message),
                    _ => tracing::info!(%correlation_id, data = %intent.payload, "{}", message),
                }
            }
        }
        Value::Null
    }
}
