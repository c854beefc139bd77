//! Node instances and handler binding
//!
//! A `NodeInstance` is a contract's metadata plus the handlers resolved for
//! it and the behaviour that runs its envelopes. Instances are built once
//! at boot by the [`NodeBinder`] and never change afterwards.

pub mod behavior;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::contract::{HandlerRequirement, NodeMetadata, OnMissing};
use crate::error::{HostError, Result};
use crate::handler::{BoundHandler, HandlerRegistry};

pub use behavior::{
    ComputeFn, ComputeNode, HandlerCallNode, NodeBehavior, NodeContext, NodeInvoker, NodeOutput,
    OrchestratorNode, ReducerNode,
};

/// A declared handler as seen by one node
#[derive(Debug, Clone)]
pub enum HandlerSlot {
    Bound(Arc<BoundHandler>),
    /// Optional handler that was not registered
    Unavailable { policy: OnMissing },
}

/// A bound, runnable node
#[derive(Clone)]
pub struct NodeInstance {
    metadata: Arc<NodeMetadata>,
    handlers: BTreeMap<String, HandlerSlot>,
    degraded: bool,
    behavior: Arc<dyn NodeBehavior>,
}

impl fmt::Debug for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInstance")
            .field("node_id", &self.metadata.node_id())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl NodeInstance {
    pub fn metadata(&self) -> &Arc<NodeMetadata> {
        &self.metadata
    }

    pub fn node_id(&self) -> &str {
        self.metadata.node_id()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn behavior(&self) -> &Arc<dyn NodeBehavior> {
        &self.behavior
    }

    pub fn handler_slots(&self) -> &BTreeMap<String, HandlerSlot> {
        &self.handlers
    }

    /// Optional handlers that were skipped during binding
    pub fn missing_handlers(&self) -> Vec<String> {
        self.handlers
            .iter()
            .filter(|(_, slot)| matches!(slot, HandlerSlot::Unavailable { .. }))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Resolve a declared handler for an operation
    pub fn handler(&self, handler_type: &str) -> Result<Arc<BoundHandler>> {
        match self.handlers.get(handler_type) {
            Some(HandlerSlot::Bound(bound)) => Ok(bound.clone()),
            Some(HandlerSlot::Unavailable { .. }) => Err(HostError::HandlerUnavailable {
                node_id: self.node_id().to_string(),
                handler_type: handler_type.to_string(),
            }),
            None => Err(HostError::HandlerBinding {
                node_id: self.node_id().to_string(),
                handler_type: handler_type.to_string(),
                reason: "not declared in contract".to_string(),
            }),
        }
    }

    pub fn status(&self) -> NodeStatus {
        if self.degraded {
            NodeStatus::Degraded {
                missing: self.missing_handlers(),
            }
        } else {
            NodeStatus::Running
        }
    }
}

/// Node health as reported by the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Degraded { missing: Vec<String> },
    Error { reason: String },
}

/// Resolves declared handlers against the registry
#[derive(Debug, Clone)]
pub struct NodeBinder {
    registry: Arc<HandlerRegistry>,
}

impl NodeBinder {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Bind one node. Never retries.
    pub fn bind(&self, metadata: Arc<NodeMetadata>, behavior: Arc<dyn NodeBehavior>) -> Result<NodeInstance> {
        let mut handlers = BTreeMap::new();
        let mut degraded = false;

        for requirement in metadata.handlers() {
            let slot = self.resolve(metadata.node_id(), requirement)?;
            if let HandlerSlot::Unavailable { policy } = &slot {
                match policy {
                    OnMissing::SkipSilently => {}
                    // `Error` is mandatory and never reaches an empty slot
                    OnMissing::WarnAndSkip | OnMissing::Error => tracing::warn!(
                        node_id = %metadata.node_id(),
                        handler_type = %requirement.handler_type,
                        "optional handler not registered; operations using it will fail"
                    ),
                    OnMissing::Degrade => {
                        tracing::warn!(
                            node_id = %metadata.node_id(),
                            handler_type = %requirement.handler_type,
                            "optional handler not registered; node degraded"
                        );
                        degraded = true;
                    }
                }
            }
            handlers.insert(requirement.handler_type.clone(), slot);
        }

        tracing::debug!(node_id = %metadata.node_id(), degraded, "node bound");
        Ok(NodeInstance {
            metadata,
            handlers,
            degraded,
            behavior,
        })
    }

    fn resolve(&self, node_id: &str, requirement: &HandlerRequirement) -> Result<HandlerSlot> {
        let Some(bound) = self.registry.resolve(&requirement.handler_type) else {
            if requirement.is_mandatory() {
                return Err(HostError::HandlerBinding {
                    node_id: node_id.to_string(),
                    handler_type: requirement.handler_type.clone(),
                    reason: "required handler not registered".to_string(),
                });
            }
            return Ok(HandlerSlot::Unavailable {
                policy: requirement.on_missing,
            });
        };

        if !bound.protocol().satisfies(&requirement.protocol) {
            return Err(HostError::HandlerBinding {
                node_id: node_id.to_string(),
                handler_type: requirement.handler_type.clone(),
                reason: format!(
                    "protocol {}@{} does not satisfy {}",
                    bound.protocol().name,
                    bound.protocol().version,
                    requirement.protocol
                ),
            });
        }
        Ok(HandlerSlot::Bound(bound))
    }
}
