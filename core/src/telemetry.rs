//! Host telemetry
//!
//! Events go out on a broadcast channel so that log and metric sinks can
//! observe the runtime without the runtime knowing about them. Counters are
//! plain atomics and snapshot into serializable structs for health reports.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::handler::breaker::CircuitState;
use crate::host::LifecycleState;
use crate::intent::IntentType;
use crate::orchestrator::WorkflowStatus;

/// Events observable by external sinks
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    LifecycleChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    NodeBound {
        node_id: String,
        degraded: bool,
    },
    NodeBindingFailed {
        node_id: String,
        reason: String,
    },
    EnvelopeCompleted {
        envelope_id: Uuid,
        node_id: String,
        duration_ms: u64,
        attempts: u32,
        success: bool,
    },
    IntentRouted {
        intent_id: Uuid,
        intent_type: IntentType,
        target: String,
        success: bool,
    },
    IntentExpired {
        intent_id: Uuid,
        intent_type: IntentType,
    },
    BreakerTransition {
        handler_type: String,
        from: CircuitState,
        to: CircuitState,
    },
    WorkflowFinished {
        workflow_id: Uuid,
        workflow: String,
        status: WorkflowStatus,
    },
    Metric {
        name: String,
        value: f64,
    },
}

/// Atomic host counters
#[derive(Debug, Default)]
pub struct HostCounters {
    envelopes_dispatched: AtomicU64,
    envelopes_failed: AtomicU64,
    envelopes_duplicate: AtomicU64,
    envelope_retries: AtomicU64,
    intents_executed: AtomicU64,
    intents_failed: AtomicU64,
    intents_expired: AtomicU64,
    workflows_completed: AtomicU64,
    workflows_compensated: AtomicU64,
    workflows_failed: AtomicU64,
    workflows_unresolved: AtomicU64,
    custom: Mutex<BTreeMap<String, f64>>,
}

/// Point-in-time copy of [`HostCounters`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub envelopes_dispatched: u64,
    pub envelopes_failed: u64,
    pub envelopes_duplicate: u64,
    pub envelope_retries: u64,
    pub intents_executed: u64,
    pub intents_failed: u64,
    pub intents_expired: u64,
    pub workflows_completed: u64,
    pub workflows_compensated: u64,
    pub workflows_failed: u64,
    pub workflows_unresolved: u64,
    pub custom: BTreeMap<String, f64>,
}

impl HostCounters {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            envelopes_dispatched: self.envelopes_dispatched.load(Ordering::Relaxed),
            envelopes_failed: self.envelopes_failed.load(Ordering::Relaxed),
            envelopes_duplicate: self.envelopes_duplicate.load(Ordering::Relaxed),
            envelope_retries: self.envelope_retries.load(Ordering::Relaxed),
            intents_executed: self.intents_executed.load(Ordering::Relaxed),
            intents_failed: self.intents_failed.load(Ordering::Relaxed),
            intents_expired: self.intents_expired.load(Ordering::Relaxed),
            workflows_completed: self.workflows_completed.load(Ordering::Relaxed),
            workflows_compensated: self.workflows_compensated.load(Ordering::Relaxed),
            workflows_failed: self.workflows_failed.load(Ordering::Relaxed),
            workflows_unresolved: self.workflows_unresolved.load(Ordering::Relaxed),
            custom: self.custom.lock().clone(),
        }
    }

    /// Accumulate a METRIC intent value under its name
    pub fn record_metric(&self, name: &str, value: f64) {
        *self.custom.lock().entry(name.to_string()).or_insert(0.0) += value;
    }
}

/// Cloneable handle to the event channel and counters
#[derive(Debug, Clone)]
pub struct Telemetry {
    sender: broadcast::Sender<HostEvent>,
    counters: Arc<HostCounters>,
}

impl Telemetry {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            counters: Arc::new(HostCounters::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: HostEvent) {
        let _ = self.sender.send(event);
    }

    pub fn counters(&self) -> &HostCounters {
        &self.counters
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }

    pub(crate) fn envelope_finished(&self, envelope_id: Uuid, node_id: &str, duration_ms: u64, attempts: u32, success: bool) {
        let counter = if success {
            &self.counters.envelopes_dispatched
        } else {
            &self.counters.envelopes_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if attempts > 1 {
            self.counters
                .envelope_retries
                .fetch_add(u64::from(attempts - 1), Ordering::Relaxed);
        }
        self.emit(HostEvent::EnvelopeCompleted {
            envelope_id,
            node_id: node_id.to_string(),
            duration_ms,
            attempts,
            success,
        });
    }

    pub(crate) fn envelope_duplicate(&self) {
        self.counters.envelopes_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn intent_routed(&self, intent_id: Uuid, intent_type: IntentType, target: &str, success: bool) {
        let counter = if success {
            &self.counters.intents_executed
        } else {
            &self.counters.intents_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.emit(HostEvent::IntentRouted {
            intent_id,
            intent_type,
            target: target.to_string(),
            success,
        });
    }

    pub(crate) fn intent_expired(&self, intent_id: Uuid, intent_type: IntentType) {
        self.counters.intents_expired.fetch_add(1, Ordering::Relaxed);
        self.emit(HostEvent::IntentExpired {
            intent_id,
            intent_type,
        });
    }

    pub(crate) fn workflow_finished(&self, workflow_id: Uuid, workflow: &str, status: WorkflowStatus) {
        let counter = match status {
            WorkflowStatus::Completed => &self.counters.workflows_completed,
            WorkflowStatus::Compensated => &self.counters.workflows_compensated,
            WorkflowStatus::Failed => &self.counters.workflows_failed,
            WorkflowStatus::CompensationFailed => &self.counters.workflows_unresolved,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.emit(HostEvent::WorkflowFinished {
            workflow_id,
            workflow: workflow.to_string(),
            status,
        });
    }

    pub(crate) fn metric(&self, name: &str, value: f64) {
        self.counters.record_metric(name, value);
        self.emit(HostEvent::Metric {
            name: name.to_string(),
            value,
        });
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(1024)
    }
}
