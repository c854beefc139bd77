//! Workflow orchestration
//!
//! Runs a declared workflow step by step in deterministic topological
//! order. Steps are dispatched as child envelopes through a [`NodeInvoker`].
//! Any step failure, step timeout or workflow timeout runs the declared
//! compensation exactly once, newest first, skipping compensations whose
//! forward steps never completed. The lease is released exactly once in
//! every outcome. The engine never retries a step.

pub mod lease;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Duration;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::contract::{WorkflowDefinition, WorkflowStep};
use crate::envelope::NodeInput;
use crate::error::{HostError, Result};
use crate::ids;
use crate::node::{NodeInvoker, NodeOutput};
use crate::telemetry::Telemetry;

pub use lease::{Lease, LeaseGuard, LeaseTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    /// A step failed and no compensation was declared
    Failed,
    /// A step failed and every compensation step succeeded
    Compensated,
    /// Compensation itself failed; needs manual intervention
    CompensationFailed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Forward,
    Compensation,
}

impl StepPhase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "step",
            Self::Compensation => "compensate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step_id: String,
    pub node_id: String,
    pub phase: StepPhase,
    pub envelope_id: Uuid,
    pub success: bool,
    /// Lease epoch after this step
    pub epoch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowReport {
    pub workflow_id: Uuid,
    pub workflow: String,
    pub node_id: String,
    pub status: WorkflowStatus,
    pub epoch: u64,
    pub steps: Vec<StepRecord>,
    pub compensation: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowReport {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

/// Workflow whose compensation failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedWorkflow {
    pub workflow_id: Uuid,
    pub workflow: String,
    pub node_id: String,
    pub failed_step: Option<String>,
    pub compensation_errors: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

struct StepFailure {
    step: String,
    error: String,
}

#[derive(Debug)]
pub struct OrchestratorEngine {
    leases: Arc<LeaseTable>,
    config: OrchestratorConfig,
    unresolved: Mutex<Vec<UnresolvedWorkflow>>,
    telemetry: Option<Telemetry>,
}

impl OrchestratorEngine {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            leases: Arc::new(LeaseTable::new()),
            config,
            unresolved: Mutex::new(Vec::new()),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    /// Workflows flagged for manual intervention
    pub fn unresolved(&self) -> Vec<UnresolvedWorkflow> {
        self.unresolved.lock().clone()
    }

    /// Run `workflow` for the envelope `parent`
    ///
    /// Step failures are reported through the returned report. `Err` means
    /// the workflow never started (bad graph or lease conflict).
    pub async fn execute(
        &self,
        node_id: &str,
        workflow: &WorkflowDefinition,
        input: Value,
        parent: &NodeInput,
        invoker: &dyn NodeInvoker,
    ) -> Result<WorkflowReport> {
        let order = workflow.execution_order().map_err(|reason| HostError::WorkflowFailed {
            workflow: workflow.name.clone(),
            step: String::new(),
            reason,
        })?;
        let workflow_id = ids::workflow_id(parent.correlation_id, &workflow.name);
        let mut guard = self.leases.acquire(workflow_id)?;
        let budget = Duration::from_millis(
            workflow
                .timeout_ms
                .unwrap_or(self.config.default_workflow_timeout_ms),
        );
        tracing::info!(%node_id, workflow = %workflow.name, %workflow_id, steps = order.len(), "workflow started");

        let mut steps = Vec::with_capacity(order.len());
        let mut outputs = HashMap::new();
        let outcome = tokio::time::timeout(
            budget,
            self.run_steps(workflow, workflow_id, &order, &input, parent, invoker, &mut guard, &mut steps, &mut outputs),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(failure),
            Err(_) => {
                let error = HostError::OrchestrationTimeout {
                    workflow: workflow.name.clone(),
                    scope: "workflow".to_string(),
                    duration: budget,
                }
                .to_string();
                let step = order.get(steps.len()).map(|s| s.id.clone()).unwrap_or_default();
                if let Some(running) = order.get(steps.len()) {
                    steps.push(StepRecord {
                        step_id: running.id.clone(),
                        node_id: running.node_id.clone(),
                        phase: StepPhase::Forward,
                        envelope_id: ids::step_envelope_id(workflow_id, StepPhase::Forward.as_str(), &running.id),
                        success: false,
                        epoch: guard.epoch(),
                        error: Some(error.clone()),
                    });
                }
                Some(StepFailure { step, error })
            }
        };

        let mut compensation = Vec::new();
        let status = match &failure {
            None => WorkflowStatus::Completed,
            Some(failed) => {
                tracing::warn!(
                    workflow = %workflow.name,
                    %workflow_id,
                    step = %failed.step,
                    error = %failed.error,
                    "workflow step failed; compensating"
                );
                let errors = self
                    .compensate(workflow, workflow_id, &input, parent, invoker, guard.epoch(), &outputs, &mut compensation)
                    .await;
                if workflow.compensation.is_empty() {
                    WorkflowStatus::Failed
                } else if errors.is_empty() {
                    WorkflowStatus::Compensated
                } else {
                    tracing::error!(
                        workflow = %workflow.name,
                        %workflow_id,
                        errors = ?errors,
                        "compensation failed; manual intervention required"
                    );
                    self.unresolved.lock().push(UnresolvedWorkflow {
                        workflow_id,
                        workflow: workflow.name.clone(),
                        node_id: node_id.to_string(),
                        failed_step: Some(failed.step.clone()),
                        compensation_errors: errors,
                        recorded_at: Utc::now(),
                    });
                    WorkflowStatus::CompensationFailed
                }
            }
        };

        let lease = guard.release();
        if let Some(telemetry) = &self.telemetry {
            telemetry.workflow_finished(workflow_id, &workflow.name, status);
        }
        tracing::info!(workflow = %workflow.name, %workflow_id, %status, epoch = lease.epoch, "workflow finished");

        let (failed_step, error) = match failure {
            Some(f) => (Some(f.step), Some(f.error)),
            None => (None, None),
        };
        Ok(WorkflowReport {
            workflow_id,
            workflow: workflow.name.clone(),
            node_id: node_id.to_string(),
            status,
            epoch: lease.epoch,
            steps,
            compensation,
            failed_step,
            error,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        workflow: &WorkflowDefinition,
        workflow_id: Uuid,
        order: &[&WorkflowStep],
        input: &Value,
        parent: &NodeInput,
        invoker: &dyn NodeInvoker,
        guard: &mut LeaseGuard,
        records: &mut Vec<StepRecord>,
        outputs: &mut HashMap<String, Value>,
    ) -> std::result::Result<(), StepFailure> {
        for step in order {
            let payload = step_payload(input, step, outputs);
            let (envelope_id, result) = self
                .invoke_step(workflow, workflow_id, StepPhase::Forward, step, payload, parent, invoker)
                .await;
            match result {
                Ok(output) => {
                    let epoch = guard.advance();
                    records.push(StepRecord {
                        step_id: step.id.clone(),
                        node_id: step.node_id.clone(),
                        phase: StepPhase::Forward,
                        envelope_id,
                        success: true,
                        epoch,
                        error: None,
                    });
                    outputs.insert(step.id.clone(), output.payload);
                }
                Err(e) => {
                    records.push(StepRecord {
                        step_id: step.id.clone(),
                        node_id: step.node_id.clone(),
                        phase: StepPhase::Forward,
                        envelope_id,
                        success: false,
                        epoch: guard.epoch(),
                        error: Some(e.to_string()),
                    });
                    return Err(StepFailure {
                        step: step.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run each applicable compensation step once, in reverse declaration order
    #[allow(clippy::too_many_arguments)]
    async fn compensate(
        &self,
        workflow: &WorkflowDefinition,
        workflow_id: Uuid,
        input: &Value,
        parent: &NodeInput,
        invoker: &dyn NodeInvoker,
        epoch: u64,
        outputs: &HashMap<String, Value>,
        records: &mut Vec<StepRecord>,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        for step in workflow.compensation.iter().rev() {
            if let Some(missing) = step.depends_on.iter().find(|dep| !outputs.contains_key(*dep)) {
                tracing::debug!(workflow = %workflow.name, step = %step.id, %missing, "compensation skipped; step never completed");
                continue;
            }
            let payload = step_payload(input, step, outputs);
            let (envelope_id, result) = self
                .invoke_step(workflow, workflow_id, StepPhase::Compensation, step, payload, parent, invoker)
                .await;
            let error = result.err().map(|e| e.to_string());
            if let Some(e) = &error {
                errors.push(format!("{}: {}", step.id, e));
            }
            records.push(StepRecord {
                step_id: step.id.clone(),
                node_id: step.node_id.clone(),
                phase: StepPhase::Compensation,
                envelope_id,
                success: error.is_none(),
                epoch,
                error,
            });
        }
        errors
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke_step(
        &self,
        workflow: &WorkflowDefinition,
        workflow_id: Uuid,
        phase: StepPhase,
        step: &WorkflowStep,
        payload: Value,
        parent: &NodeInput,
        invoker: &dyn NodeInvoker,
    ) -> (Uuid, Result<NodeOutput>) {
        let envelope_id = ids::step_envelope_id(workflow_id, phase.as_str(), &step.id);
        let envelope = parent.child_envelope(envelope_id, &step.node_id, payload);
        let budget = Duration::from_millis(step.timeout_ms.unwrap_or(self.config.default_step_timeout_ms));
        tracing::debug!(workflow = %workflow.name, step = %step.id, node_id = %step.node_id, ?phase, "dispatching step");

        let result = match tokio::time::timeout(budget, invoker.invoke(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(HostError::OrchestrationTimeout {
                workflow: workflow.name.clone(),
                scope: format!("step {}", step.id),
                duration: budget,
            }),
        };
        (envelope_id, result)
    }
}

/// Workflow input, overlaid with the step's static input and the outputs
/// of its dependencies under `upstream`
fn step_payload(input: &Value, step: &WorkflowStep, outputs: &HashMap<String, Value>) -> Value {
    let mut payload = match input {
        Value::Object(fields) => fields.clone(),
        Value::Null => Map::new(),
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("input".to_string(), other.clone());
            wrapped
        }
    };
    if let Some(Value::Object(overlay)) = &step.input {
        for (k, v) in overlay {
            payload.insert(k.clone(), v.clone());
        }
    }
    if !step.depends_on.is_empty() {
        let upstream: Map<String, Value> = step
            .depends_on
            .iter()
            .filter_map(|dep| outputs.get(dep).map(|v| (dep.clone(), v.clone())))
            .collect();
        payload.insert("upstream".to_string(), Value::Object(upstream));
    }
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::fixtures::INGESTION_ORCHESTRATOR;
    use crate::contract::Contract;
    use crate::envelope::Envelope;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;

    /// Invoker that records envelopes and fails for chosen nodes
    #[derive(Default)]
    struct RecordingInvoker {
        seen: Mutex<Vec<(String, Value)>>,
        failing: HashSet<String>,
        failing_payload_op: Option<String>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl NodeInvoker for RecordingInvoker {
        async fn invoke(&self, envelope: Envelope) -> Result<NodeOutput> {
            self.seen
                .lock()
                .push((envelope.node_id.clone(), envelope.payload.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let op = envelope.payload.get("operation").and_then(Value::as_str);
            if self.failing.contains(&envelope.node_id) && (self.failing_payload_op.is_none() || op == self.failing_payload_op.as_deref()) {
                return Err(HostError::NodeFailed {
                    node_id: envelope.node_id,
                    message: "boom".to_string(),
                });
            }
            Ok(NodeOutput::payload(json!({"from": envelope.node_id})))
        }
    }

    fn workflow() -> WorkflowDefinition {
        Contract::from_yaml(INGESTION_ORCHESTRATOR).unwrap().workflows.remove(0)
    }

    fn parent() -> NodeInput {
        Envelope::new("ingestion_orchestrator", json!({})).to_node_input()
    }

    fn engine() -> OrchestratorEngine {
        OrchestratorEngine::new(OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn test_successful_workflow_advances_epoch() {
        let engine = engine();
        let invoker = RecordingInvoker::default();
        let report = engine
            .execute("ingestion_orchestrator", &workflow(), json!({"doc": "d1"}), &parent(), &invoker)
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.epoch, 2);
        assert!(report.compensation.is_empty());
        let seen = invoker.seen.lock().clone();
        assert_eq!(seen[0].0, "document_parser_compute");
        assert_eq!(seen[1].0, "vector_index_effect");
        assert_eq!(seen[1].1["doc"], "d1");
        assert_eq!(seen[1].1["upstream"]["parse"]["from"], "document_parser_compute");
        assert_eq!(engine.leases().active_count(), 0);
    }

    #[tokio::test]
    async fn test_step_failure_compensates_once() {
        let engine = engine();
        let invoker = RecordingInvoker {
            failing: HashSet::from(["vector_index_effect".to_string()]),
            failing_payload_op: Some("upsert".to_string()),
            ..Default::default()
        };
        let report = engine
            .execute("ingestion_orchestrator", &workflow(), json!({"operation": "upsert"}), &parent(), &invoker)
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Compensated);
        assert_eq!(report.failed_step.as_deref(), Some("index"));
        assert_eq!(report.epoch, 1);
        assert_eq!(report.compensation.len(), 1);
        assert!(report.compensation[0].success);

        let seen = invoker.seen.lock().clone();
        let deletes = seen.iter().filter(|(_, p)| p["operation"] == "delete").count();
        assert_eq!(deletes, 1);
        assert_eq!(engine.leases().acquired_count(), 1);
        assert_eq!(engine.leases().released_count(), 1);
        assert!(engine.unresolved().is_empty());
    }

    /// parse -> index, with one compensation per forward step plus a cleanup
    fn layered_workflow() -> WorkflowDefinition {
        let mut wf = workflow();
        let undo = |id: &str, node_id: &str, undoes: &[&str]| WorkflowStep {
            id: id.to_string(),
            node_id: node_id.to_string(),
            depends_on: undoes.iter().map(|s| s.to_string()).collect(),
            timeout_ms: None,
            input: Some(json!({"operation": "delete"})),
        };
        wf.compensation = vec![
            undo("release", "notification_effect", &[]),
            undo("unparse", "document_store_effect", &["parse"]),
            undo("unindex", "vector_index_effect", &["index"]),
        ];
        wf
    }

    fn compensated(report: &WorkflowReport) -> Vec<&str> {
        report.compensation.iter().map(|r| r.step_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_first_step_failure_skips_dependent_compensation() {
        let engine = engine();
        let invoker = RecordingInvoker {
            failing: HashSet::from(["document_parser_compute".to_string()]),
            ..Default::default()
        };
        let report = engine
            .execute("ingestion_orchestrator", &layered_workflow(), json!({}), &parent(), &invoker)
            .await
            .unwrap();

        assert_eq!(report.failed_step.as_deref(), Some("parse"));
        assert_eq!(report.status, WorkflowStatus::Compensated);
        assert_eq!(compensated(&report), vec!["release"]);
        let nodes: Vec<String> = invoker.seen.lock().iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(nodes, vec!["document_parser_compute", "notification_effect"]);
    }

    #[tokio::test]
    async fn test_compensation_runs_newest_first() {
        let engine = engine();
        let invoker = RecordingInvoker {
            failing: HashSet::from(["vector_index_effect".to_string()]),
            ..Default::default()
        };
        let report = engine
            .execute("ingestion_orchestrator", &layered_workflow(), json!({}), &parent(), &invoker)
            .await
            .unwrap();

        assert_eq!(report.failed_step.as_deref(), Some("index"));
        assert_eq!(compensated(&report), vec!["unparse", "release"]);
        // The undo of a completed step sees that step's output
        let seen = invoker.seen.lock().clone();
        let unparse = seen.iter().find(|(n, _)| n == "document_store_effect").unwrap();
        assert_eq!(unparse.1["upstream"]["parse"]["from"], "document_parser_compute");
    }

    #[tokio::test]
    async fn test_failed_compensation_is_unresolved() {
        let engine = engine();
        let invoker = RecordingInvoker {
            failing: HashSet::from(["vector_index_effect".to_string()]),
            ..Default::default()
        };
        let report = engine
            .execute("ingestion_orchestrator", &workflow(), json!({}), &parent(), &invoker)
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::CompensationFailed);
        assert_eq!(report.compensation.len(), 1);
        assert!(!report.compensation[0].success);
        assert_eq!(engine.leases().released_count(), 1);

        let unresolved = engine.unresolved();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].failed_step.as_deref(), Some("index"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout_runs_compensation() {
        let mut wf = workflow();
        wf.timeout_ms = Some(1_000);
        let engine = engine();
        let invoker = RecordingInvoker {
            delay: Some(Duration::from_millis(800)),
            ..Default::default()
        };
        let report = engine
            .execute("ingestion_orchestrator", &wf, json!({}), &parent(), &invoker)
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Compensated);
        assert_eq!(report.failed_step.as_deref(), Some("index"));
        assert!(report.error.unwrap().contains("orchestration timeout"));
        assert_eq!(report.steps.len(), 2);
        assert!(!report.steps[1].success);
        assert_eq!(engine.leases().released_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let mut wf = workflow();
        wf.steps[0].timeout_ms = Some(100);
        let engine = engine();
        let invoker = RecordingInvoker {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let report = engine
            .execute("ingestion_orchestrator", &wf, json!({}), &parent(), &invoker)
            .await
            .unwrap();

        assert_eq!(report.failed_step.as_deref(), Some("parse"));
        assert!(report.error.unwrap().contains("step parse"));
        assert_eq!(report.epoch, 0);
    }

    #[tokio::test]
    async fn test_lease_conflict() {
        let engine = engine();
        let parent = parent();
        let held = engine
            .leases()
            .acquire(ids::workflow_id(parent.correlation_id, "ingest_document"))
            .unwrap();

        let err = engine
            .execute("ingestion_orchestrator", &workflow(), json!({}), &parent, &RecordingInvoker::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::LeaseConflict { .. }));
        drop(held);
    }

    #[tokio::test]
    async fn test_step_envelope_ids_are_deterministic() {
        let parent = parent();
        let a = engine()
            .execute("ingestion_orchestrator", &workflow(), json!({}), &parent, &RecordingInvoker::default())
            .await
            .unwrap();
        let b = engine()
            .execute("ingestion_orchestrator", &workflow(), json!({}), &parent, &RecordingInvoker::default())
            .await
            .unwrap();
        assert_eq!(a.workflow_id, b.workflow_id);
        assert_eq!(a.steps[0].envelope_id, b.steps[0].envelope_id);
    }
}
