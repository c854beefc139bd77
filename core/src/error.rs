//! Structured error types for the node host
//!
//! One taxonomy for the whole runtime: contract loading, handler binding,
//! handler calls, FSM evaluation, orchestration, routing and boot. Every
//! variant carries enough context to be logged without the caller adding more.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Primary error type for host operations
#[derive(Error, Debug)]
pub enum HostError {
    // =========================================================================
    // Contract Errors
    // =========================================================================
    /// Contract document is malformed, incomplete or inconsistent
    #[error("contract validation failed for {node_id}: {reason}")]
    ContractValidation { node_id: String, reason: String },

    /// A second contract claimed an already loaded node_id
    #[error("duplicate node_id {node_id}: already loaded at version {existing_version}")]
    DuplicateNodeId {
        node_id: String,
        existing_version: String,
    },

    /// Contract store no longer accepts loads
    #[error("contract store is frozen; cannot load {node_id}")]
    StoreFrozen { node_id: String },

    // =========================================================================
    // Handler Errors
    // =========================================================================
    /// Required handler missing or protocol mismatch at bind time
    #[error("handler binding failed for {node_id}: {handler_type} ({reason})")]
    HandlerBinding {
        node_id: String,
        handler_type: String,
        reason: String,
    },

    /// Optional handler was skipped during binding and an operation needs it
    #[error("handler unavailable: {handler_type} is not bound on {node_id}")]
    HandlerUnavailable {
        node_id: String,
        handler_type: String,
    },

    /// No handler registered under this capability name
    #[error("handler not registered: {handler_type}")]
    HandlerNotFound { handler_type: String },

    /// Handler reported a failure
    #[error("handler call failed: {handler_type}.{operation} - {message}")]
    HandlerFailed {
        handler_type: String,
        operation: String,
        message: String,
        retryable: bool,
    },

    /// Handler did not answer within the node's budget
    #[error("handler timeout: {handler_type}.{operation} after {duration:?}")]
    HandlerTimeout {
        handler_type: String,
        operation: String,
        duration: Duration,
    },

    /// Breaker rejected the call without invoking the handler
    #[error("circuit open for handler {handler_type}")]
    CircuitOpen { handler_type: String },

    // =========================================================================
    // Reducer Errors
    // =========================================================================
    /// No transition for the (state, event) pair, or the state is terminal
    #[error("no transition for {fsm_type} entity {entity_id}: {current_state} on {event} ({reason})")]
    FsmTransition {
        fsm_type: String,
        entity_id: String,
        current_state: String,
        event: String,
        reason: String,
    },

    /// FSM type tag not known to the engine
    #[error("unknown fsm type: {0}")]
    UnknownFsmType(String),

    /// FSM table failed structural validation
    #[error("invalid fsm definition {fsm_type}: {reason}")]
    InvalidFsmDefinition { fsm_type: String, reason: String },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    /// Step or whole workflow exceeded its time budget
    #[error("orchestration timeout: workflow {workflow} ({scope}) after {duration:?}")]
    OrchestrationTimeout {
        workflow: String,
        scope: String,
        duration: Duration,
    },

    /// A workflow step failed
    #[error("workflow {workflow} failed at step {step}: {reason}")]
    WorkflowFailed {
        workflow: String,
        step: String,
        reason: String,
    },

    /// Workflow is already running under another lease
    #[error("workflow {workflow_id} is already leased")]
    LeaseConflict { workflow_id: String },

    /// Orchestrator was asked for a workflow it does not declare
    #[error("unknown workflow {workflow} on {node_id}")]
    UnknownWorkflow { node_id: String, workflow: String },

    // =========================================================================
    // Routing Errors
    // =========================================================================
    /// No node registered under this id
    #[error("unknown node: {node_id}")]
    UnknownNode { node_id: String },

    /// Node exists but failed binding
    #[error("node {node_id} is unavailable: {reason}")]
    NodeUnavailable { node_id: String, reason: String },

    /// COMPUTE and EFFECT nodes may not emit intents
    #[error("{kind} node {node_id} returned {count} intents; only reducers and orchestrators may emit intents")]
    IntentNotPermitted {
        node_id: String,
        kind: String,
        count: usize,
    },

    /// Node payload did not have the expected shape
    #[error("invalid payload for {node_id}: {reason}")]
    InvalidPayload { node_id: String, reason: String },

    /// Node behaviour failed
    #[error("node {node_id} failed: {message}")]
    NodeFailed { node_id: String, message: String },

    /// Envelope was produced for an incompatible schema
    #[error("envelope version {found} is incompatible with {expected}")]
    EnvelopeVersion { found: String, expected: String },

    /// Scheduler is not running
    #[error("scheduler is not accepting work")]
    SchedulerClosed,

    /// Inline work asked for the exclusive lane while holding a node lane
    #[error("cannot run strictly sequential {node_id} while holding the {held} lane")]
    LaneConflict { node_id: String, held: String },

    /// Event source failure
    #[error("transport error: {message}")]
    Transport { message: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Transition not allowed by the lifecycle state machine
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidLifecycle { from: String, to: String },

    /// A fatal boot step failed
    #[error("boot aborted during {stage}: {reason}")]
    BootAborted { stage: String, reason: String },

    // =========================================================================
    // Lockfile Errors
    // =========================================================================
    /// Protocols changed incompatibly without a major version bump
    #[error("protocol lockfile drift: {}", .changes.join("; "))]
    LockfileDrift { changes: Vec<String> },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration value out of range or inconsistent
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Profile name not present in the configuration
    #[error("profile not found: {profile}")]
    ProfileNotFound { profile: String },

    /// File not found
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl HostError {
    /// Check if error is retryable (transient)
    ///
    /// Only handler-level failures qualify. Breaker rejections, FSM errors and
    /// binding problems will not change on a second attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HandlerFailed { retryable, .. } => *retryable,
            Self::HandlerTimeout { .. } => true,
            Self::Transport { .. } => true,

            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),

            Self::ContractValidation { .. }
            | Self::DuplicateNodeId { .. }
            | Self::StoreFrozen { .. }
            | Self::HandlerBinding { .. }
            | Self::HandlerUnavailable { .. }
            | Self::HandlerNotFound { .. }
            | Self::CircuitOpen { .. }
            | Self::FsmTransition { .. }
            | Self::UnknownFsmType(_)
            | Self::InvalidFsmDefinition { .. }
            | Self::OrchestrationTimeout { .. }
            | Self::WorkflowFailed { .. }
            | Self::LeaseConflict { .. }
            | Self::UnknownWorkflow { .. }
            | Self::UnknownNode { .. }
            | Self::NodeUnavailable { .. }
            | Self::IntentNotPermitted { .. }
            | Self::InvalidPayload { .. }
            | Self::NodeFailed { .. }
            | Self::EnvelopeVersion { .. }
            | Self::SchedulerClosed
            | Self::LaneConflict { .. }
            | Self::InvalidLifecycle { .. }
            | Self::BootAborted { .. }
            | Self::LockfileDrift { .. }
            | Self::InvalidConfig { .. }
            | Self::ProfileNotFound { .. }
            | Self::FileNotFound { .. }
            | Self::Json(_)
            | Self::Serialization(_) => false,
        }
    }

    /// Errors that abort boot instead of degrading a single node
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ContractValidation { .. }
                | Self::DuplicateNodeId { .. }
                | Self::InvalidConfig { .. }
                | Self::ProfileNotFound { .. }
                | Self::BootAborted { .. }
                | Self::InvalidFsmDefinition { .. }
        )
    }

    /// Stable machine-readable code, used in reports and telemetry
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContractValidation { .. } | Self::DuplicateNodeId { .. } | Self::StoreFrozen { .. } => {
                "CONTRACT_VALIDATION"
            }
            Self::HandlerBinding { .. } => "HANDLER_BINDING",
            Self::HandlerUnavailable { .. } => "HANDLER_UNAVAILABLE",
            Self::HandlerNotFound { .. } => "HANDLER_NOT_FOUND",
            Self::HandlerFailed { .. } => "HANDLER_FAILED",
            Self::HandlerTimeout { .. } => "HANDLER_TIMEOUT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::FsmTransition { .. } => "FSM_TRANSITION",
            Self::UnknownFsmType(_) | Self::InvalidFsmDefinition { .. } => "FSM_DEFINITION",
            Self::OrchestrationTimeout { .. } => "ORCHESTRATION_TIMEOUT",
            Self::WorkflowFailed { .. } | Self::UnknownWorkflow { .. } => "WORKFLOW_FAILED",
            Self::LeaseConflict { .. } => "LEASE_CONFLICT",
            Self::UnknownNode { .. } => "UNKNOWN_NODE",
            Self::NodeUnavailable { .. } => "NODE_UNAVAILABLE",
            Self::IntentNotPermitted { .. } => "INTENT_NOT_PERMITTED",
            Self::InvalidPayload { .. } | Self::EnvelopeVersion { .. } => "INVALID_PAYLOAD",
            Self::NodeFailed { .. } => "NODE_FAILED",
            Self::SchedulerClosed => "SCHEDULER_CLOSED",
            Self::LaneConflict { .. } => "LANE_CONFLICT",
            Self::Transport { .. } => "TRANSPORT",
            Self::InvalidLifecycle { .. } | Self::BootAborted { .. } => "LIFECYCLE",
            Self::LockfileDrift { .. } => "LOCKFILE_DRIFT",
            Self::InvalidConfig { .. } | Self::ProfileNotFound { .. } => "CONFIG",
            Self::FileNotFound { .. } | Self::Io(_) => "IO",
            Self::Json(_) | Self::Serialization(_) => "SERIALIZATION",
        }
    }

    pub(crate) fn contract(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContractValidation {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<serde_yml::Error> for HostError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for HostError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for HostError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias using HostError
pub type Result<T> = std::result::Result<T, HostError>;
