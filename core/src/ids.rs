//! Deterministic identifiers
//!
//! Reducer intents, workflow ids and orchestrator step envelopes are derived
//! from their inputs so that replaying the same input yields the same ids.

use uuid::Uuid;

/// Namespace for every name-based id the host derives
pub const HOST_NAMESPACE: Uuid = Uuid::from_u128(0x6e6f_6465_686f_7374_8000_0000_0000_0001);

/// UUIDv5 over the `:`-joined parts
pub fn derive(parts: &[&str]) -> Uuid {
    Uuid::new_v5(&HOST_NAMESPACE, parts.join(":").as_bytes())
}

/// Workflow execution id: one per (correlation, workflow name)
pub fn workflow_id(correlation_id: Uuid, workflow: &str) -> Uuid {
    derive(&["workflow", &correlation_id.to_string(), workflow])
}

/// Envelope id for one orchestrator step or compensation step
pub fn step_envelope_id(workflow_id: Uuid, phase: &str, step_id: &str) -> Uuid {
    derive(&["step", &workflow_id.to_string(), phase, step_id])
}
