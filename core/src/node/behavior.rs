//! Node behaviours
//!
//! A behaviour is the code that runs one envelope for one node. Behaviours
//! reach I/O only through [`NodeContext::call_handler`], which enforces the
//! node's declared handlers, its breaker and its call budget.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use super::NodeInstance;
use crate::envelope::{Envelope, NodeInput};
use crate::error::{HostError, Result};
use crate::handler::HandlerRequest;
use crate::intent::Intent;
use crate::orchestrator::OrchestratorEngine;
use crate::reducer::{FsmType, ReducerEngine, TransitionMetadata};

/// What a node returns for one envelope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    pub payload: Value,
    /// Only REDUCER and ORCHESTRATOR nodes may return intents
    pub intents: Vec<Intent>,
}

impl NodeOutput {
    pub fn payload(payload: Value) -> Self {
        Self {
            payload,
            intents: Vec::new(),
        }
    }

    pub fn with_intents(mut self, intents: Vec<Intent>) -> Self {
        self.intents = intents;
        self
    }
}

/// Runs envelopes inline on behalf of a node (orchestrator steps)
#[async_trait]
pub trait NodeInvoker: Send + Sync {
    async fn invoke(&self, envelope: Envelope) -> Result<NodeOutput>;
}

/// Per-envelope view of the running node
pub struct NodeContext<'a> {
    instance: &'a NodeInstance,
    invoker: &'a dyn NodeInvoker,
}

impl<'a> NodeContext<'a> {
    pub fn new(instance: &'a NodeInstance, invoker: &'a dyn NodeInvoker) -> Self {
        Self { instance, invoker }
    }

    pub fn instance(&self) -> &'a NodeInstance {
        self.instance
    }

    pub fn node_id(&self) -> &'a str {
        self.instance.node_id()
    }

    pub fn invoker(&self) -> &'a dyn NodeInvoker {
        self.invoker
    }

    /// Call a declared handler within the node's time budget
    pub async fn call_handler(&self, handler_type: &str, operation: &str, payload: Value, input: &NodeInput) -> Result<Value> {
        let bound = self.instance.handler(handler_type)?;
        let request = HandlerRequest::new(operation, payload).with_correlation(input.correlation_id);
        bound.call(request, self.instance.metadata().call_timeout()).await
    }
}

#[async_trait]
pub trait NodeBehavior: Send + Sync {
    async fn execute(&self, ctx: NodeContext<'_>, input: NodeInput) -> Result<NodeOutput>;
}

pub type ComputeFn = Arc<dyn Fn(&Value) -> std::result::Result<Value, String> + Send + Sync>;

/// Pure transformation of the payload
#[derive(Clone)]
pub struct ComputeNode {
    compute: ComputeFn,
}

impl ComputeNode {
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            compute: Arc::new(compute),
        }
    }

    pub fn from_fn(compute: ComputeFn) -> Self {
        Self { compute }
    }
}

impl fmt::Debug for ComputeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ComputeNode")
    }
}

#[async_trait]
impl NodeBehavior for ComputeNode {
    async fn execute(&self, ctx: NodeContext<'_>, input: NodeInput) -> Result<NodeOutput> {
        let payload = (self.compute)(&input.payload).map_err(|message| HostError::NodeFailed {
            node_id: ctx.node_id().to_string(),
            message,
        })?;
        Ok(NodeOutput::payload(payload))
    }
}

/// Generic effect: forwards one operation to a declared handler
///
/// Payload: `{"handler"?, "operation", "input"?}`. Without `handler` the
/// node's only declared handler is used; without `input` the remaining
/// payload fields are sent.
#[derive(Debug, Clone, Default)]
pub struct HandlerCallNode;

#[async_trait]
impl NodeBehavior for HandlerCallNode {
    async fn execute(&self, ctx: NodeContext<'_>, input: NodeInput) -> Result<NodeOutput> {
        let invalid = |reason: &str| HostError::InvalidPayload {
            node_id: ctx.node_id().to_string(),
            reason: reason.to_string(),
        };
        let fields = input.payload.as_object().ok_or_else(|| invalid("payload must be an object"))?;

        let operation = fields
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing 'operation'"))?;
        let handler_type = match fields.get("handler").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => match ctx.instance().metadata().handlers() {
                [only] => only.handler_type.clone(),
                _ => return Err(invalid("'handler' is required when several handlers are declared")),
            },
        };
        let request = match fields.get("input") {
            Some(explicit) => explicit.clone(),
            None => {
                let rest: Map<String, Value> = fields
                    .iter()
                    .filter(|(k, _)| k.as_str() != "operation" && k.as_str() != "handler")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Value::Object(rest)
            }
        };

        let result = ctx.call_handler(&handler_type, operation, request, &input).await?;
        Ok(NodeOutput::payload(result))
    }
}

/// Loads entity state, evaluates the FSM and returns its intents
///
/// Payload: `{"entity_id", "event", "current_state"?, "data"?}`. When
/// `current_state` is absent the state is read from `state_store`, falling
/// back to the FSM's initial state.
#[derive(Debug, Clone)]
pub struct ReducerNode {
    engine: Arc<ReducerEngine>,
}

impl ReducerNode {
    pub fn new(engine: Arc<ReducerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl NodeBehavior for ReducerNode {
    async fn execute(&self, ctx: NodeContext<'_>, input: NodeInput) -> Result<NodeOutput> {
        let node_id = ctx.node_id();
        let invalid = |reason: &str| HostError::InvalidPayload {
            node_id: node_id.to_string(),
            reason: reason.to_string(),
        };
        let fsm_type = ctx
            .instance()
            .metadata()
            .fsm_type()
            .ok_or_else(|| invalid("reducer has no fsm_type"))?;
        let entity_id = input
            .payload
            .get("entity_id")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing 'entity_id'"))?;
        let event = input
            .payload
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing 'event'"))?;

        let current_state = match input.payload.get("current_state").and_then(Value::as_str) {
            Some(state) => state.to_string(),
            None => self.stored_state(&ctx, fsm_type, entity_id, &input).await?,
        };

        let metadata = TransitionMetadata {
            correlation_id: input.correlation_id,
            causation_id: Some(input.envelope_id),
            timestamp: input.timestamp,
            data: input.payload.get("data").cloned().unwrap_or(Value::Null),
        };
        let reduction = self
            .engine
            .evaluate(fsm_type, entity_id, &current_state, event, &metadata)?;

        tracing::debug!(
            %node_id,
            %fsm_type,
            entity_id,
            from = %reduction.previous_state,
            to = %reduction.new_state,
            intents = reduction.intents.len(),
            "reduced"
        );
        let payload = serde_json::json!({
            "entity_id": entity_id,
            "fsm_type": fsm_type,
            "previous_state": reduction.previous_state,
            "new_state": reduction.new_state,
        });
        Ok(NodeOutput::payload(payload).with_intents(reduction.intents))
    }
}

impl ReducerNode {
    async fn stored_state(&self, ctx: &NodeContext<'_>, fsm_type: FsmType, entity_id: &str, input: &NodeInput) -> Result<String> {
        let initial = || self.engine.initial_state(fsm_type).map(str::to_string);
        if ctx.instance().handler("state_store").is_err() {
            return initial();
        }
        let row = ctx
            .call_handler(
                "state_store",
                "get",
                serde_json::json!({"fsm_type": fsm_type, "entity_id": entity_id}),
                input,
            )
            .await?;
        match row.get("state").and_then(Value::as_str) {
            Some(state) => Ok(state.to_string()),
            None => initial(),
        }
    }
}

/// Runs one of the node's declared workflows
///
/// Payload: `{"workflow"?, "input"?}`. Without `workflow` the node's only
/// workflow runs; without `input` the whole payload is the workflow input.
#[derive(Debug, Clone)]
pub struct OrchestratorNode {
    engine: Arc<OrchestratorEngine>,
}

impl OrchestratorNode {
    pub fn new(engine: Arc<OrchestratorEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl NodeBehavior for OrchestratorNode {
    async fn execute(&self, ctx: NodeContext<'_>, input: NodeInput) -> Result<NodeOutput> {
        let metadata = ctx.instance().metadata();
        let requested = input.payload.get("workflow").and_then(Value::as_str);
        let workflow = match (requested, metadata.workflows()) {
            (Some(name), _) => metadata.workflow(name).ok_or_else(|| HostError::UnknownWorkflow {
                node_id: ctx.node_id().to_string(),
                workflow: name.to_string(),
            })?,
            (None, [only]) => only,
            (None, _) => {
                return Err(HostError::InvalidPayload {
                    node_id: ctx.node_id().to_string(),
                    reason: "'workflow' is required when several workflows are declared".to_string(),
                })
            }
        };
        let workflow_input = input.payload.get("input").cloned().unwrap_or_else(|| input.payload.clone());

        let report = self
            .engine
            .execute(ctx.node_id(), workflow, workflow_input, &input, ctx.invoker())
            .await?;
        if !report.is_success() {
            return Err(HostError::WorkflowFailed {
                workflow: workflow.name.clone(),
                step: report.failed_step.clone().unwrap_or_default(),
                reason: report.error.clone().unwrap_or_else(|| report.status.to_string()),
            });
        }
        Ok(NodeOutput::payload(serde_json::to_value(&report)?))
    }
}
