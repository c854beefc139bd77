//! End-to-end scenarios across the host, router, reducer and orchestrator

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::contract::fixtures::{INGESTION_REDUCER, PARSER_COMPUTE, VECTOR_INDEX_EFFECT};
use crate::contract::{Contract, NodeMetadata};
use crate::envelope::{Envelope, NodeInput};
use crate::error::{HostError, Result};
use crate::handler::memory::{InMemoryCache, InMemoryMessageProducer, InMemoryStateStore, InMemoryVectorStore};
use crate::handler::test_support::ScriptedHandler;
use crate::handler::{Handler, HandlerRegistry, HandlerRequest};
use crate::host::{HostBuilder, LifecycleState, RuntimeHost};
use crate::intent::IntentType;
use crate::intent_router::IntentStatus;
use crate::node::{NodeBehavior, NodeBinder, NodeContext, NodeOutput, NodeStatus};
use crate::reducer::{FsmType, ReducerEngine, TransitionMetadata};
use crate::transport::{EventSource, InMemoryEventSource};

const ORCHESTRATOR: &str = r#"
node_id: ingestion_orchestrator
version: 2.0.0
kind: ORCHESTRATOR
concurrency: parallelizable
workflows:
  - name: ingest_document
    timeout_ms: 5000
    steps:
      - id: parse
        node_id: document_parser_compute
      - id: index
        node_id: vector_index_effect
        depends_on: [parse]
    compensation:
      - id: unindex
        node_id: vector_index_effect
        input: {operation: delete}
"#;

/// Indexes the parse step's output, or deletes it when asked to
struct IndexNode {
    calls: AtomicU32,
    fail_index: bool,
    fail_delete: bool,
}

impl IndexNode {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_index: false,
            fail_delete: false,
        }
    }
}

#[async_trait]
impl NodeBehavior for IndexNode {
    async fn execute(&self, ctx: NodeContext<'_>, input: NodeInput) -> Result<NodeOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = input.payload["entity_id"].as_str().unwrap_or_default().to_string();
        let deleting = input.payload["operation"] == "delete";
        if (deleting && self.fail_delete) || (!deleting && self.fail_index) {
            return Err(HostError::NodeFailed {
                node_id: ctx.node_id().to_string(),
                message: "index unavailable".to_string(),
            });
        }
        let result = if deleting {
            ctx.call_handler("vector_store", "delete", json!({ "id": id }), &input).await?
        } else {
            let parsed = &input.payload["upstream"]["parse"];
            let request = json!({"id": id, "embedding": parsed["embedding"], "content": parsed["content"]});
            ctx.call_handler("vector_store", "upsert", request, &input).await?
        };
        Ok(NodeOutput::payload(result))
    }
}

fn parse_document(payload: &Value) -> std::result::Result<Value, String> {
    let text = payload["data"]["text"]
        .as_str()
        .ok_or_else(|| "missing data.text".to_string())?;
    let words = text.split_whitespace().count() as f64;
    Ok(json!({"content": text, "embedding": [words, text.len() as f64]}))
}

struct Stores {
    state: Arc<InMemoryStateStore>,
    vectors: Arc<InMemoryVectorStore>,
}

fn stores() -> (Stores, Vec<Arc<dyn Handler>>) {
    let state = Arc::new(InMemoryStateStore::new());
    let vectors = Arc::new(InMemoryVectorStore::new());
    let handlers: Vec<Arc<dyn Handler>> = vec![
        state.clone(),
        vectors.clone(),
        Arc::new(InMemoryCache::new()),
        Arc::new(InMemoryMessageProducer::new()),
    ];
    (Stores { state, vectors }, handlers)
}

fn ingestion_builder(handlers: Vec<Arc<dyn Handler>>, index: Arc<IndexNode>) -> HostBuilder {
    HostBuilder::new(HostConfig::default())
        .handlers(handlers)
        .contract_str(PARSER_COMPUTE)
        .contract_str(INGESTION_REDUCER)
        .contract_str(VECTOR_INDEX_EFFECT)
        .contract_str(ORCHESTRATOR)
        .compute("document_parser_compute", parse_document)
        .behavior("vector_index_effect", index)
}

fn idle_source() -> Box<dyn EventSource> {
    let (_tx, source) = InMemoryEventSource::channel(1);
    Box::new(source)
}

fn parse_completed(entity_id: &str, text: &str) -> Envelope {
    Envelope::new(
        "ingestion_reducer",
        json!({"entity_id": entity_id, "event": "PARSE_COMPLETED", "data": {"text": text}}),
    )
}

fn meta(yaml: &str) -> Arc<NodeMetadata> {
    Arc::new(NodeMetadata::from_contract(Contract::from_yaml(yaml).unwrap()).unwrap())
}

// =========================================================================
// Scenarios
// =========================================================================

#[test]
fn test_ingestion_parse_completed() {
    let engine = ReducerEngine::with_builtin().unwrap();
    let metadata = TransitionMetadata::new(uuid::Uuid::new_v4(), chrono::Utc::now());

    let reduction = engine
        .evaluate(FsmType::Ingestion, "doc-1", "RECEIVED", "PARSE_COMPLETED", &metadata)
        .unwrap();
    assert_eq!(reduction.new_state, "PARSED");
    let types: Vec<IntentType> = reduction.intents.iter().map(|i| i.intent_type).collect();
    assert_eq!(types, vec![IntentType::StateUpdate, IntentType::WorkflowTrigger]);

    let again = engine
        .evaluate(FsmType::Ingestion, "doc-1", "RECEIVED", "PARSE_COMPLETED", &metadata)
        .unwrap();
    assert_eq!(again, reduction);
}

#[test]
fn test_terminal_state_rejects_events() {
    let engine = ReducerEngine::with_builtin().unwrap();
    let metadata = TransitionMetadata::new(uuid::Uuid::new_v4(), chrono::Utc::now());
    let err = engine
        .evaluate(FsmType::Ingestion, "doc-1", "COMPLETED", "PARSE_COMPLETED", &metadata)
        .unwrap_err();
    assert!(matches!(err, HostError::FsmTransition { .. }));
    assert_eq!(err.code(), "FSM_TRANSITION");
}

#[tokio::test]
async fn test_missing_required_handler() {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(InMemoryCache::new())).unwrap();
    let binder = NodeBinder::new(Arc::new(registry));
    let err = binder
        .bind(meta(VECTOR_INDEX_EFFECT), Arc::new(crate::node::HandlerCallNode))
        .unwrap_err();
    assert!(matches!(err, HostError::HandlerBinding { ref handler_type, .. } if handler_type == "vector_store"));

    let host = HostBuilder::new(HostConfig::default())
        .handler(Arc::new(InMemoryCache::new()))
        .contract_str(PARSER_COMPUTE)
        .contract_str(VECTOR_INDEX_EFFECT)
        .compute("document_parser_compute", parse_document)
        .boot(idle_source())
        .await
        .unwrap();

    assert_eq!(host.state(), LifecycleState::Degraded);
    assert_eq!(host.node_status("document_parser_compute"), Some(&NodeStatus::Running));
    match host.node_status("vector_index_effect") {
        Some(NodeStatus::Error { reason }) => assert!(reason.contains("vector_store")),
        other => panic!("unexpected status: {other:?}"),
    }
    let report = host
        .dispatch(Envelope::new("document_parser_compute", json!({"data": {"text": "still works"}})))
        .await
        .unwrap();
    assert_eq!(report.output["content"], "still works");
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_recovers() {
    let config = HostConfig::from_toml_str(
        r#"
[breaker.defaults]
failure_threshold = 5
recovery_timeout_ms = 10000
half_open_max_calls = 1
"#,
    )
    .unwrap();
    let cache = Arc::new(ScriptedHandler::new("cache", "CacheProtocol").failing());
    let host = HostBuilder::new(config)
        .handler(cache.clone())
        .boot(idle_source())
        .await
        .unwrap();
    let bound = host.registry().require("cache").unwrap();
    let call = || bound.call(HandlerRequest::new("get", json!({"key": "k"})), Duration::from_secs(1));

    for _ in 0..5 {
        assert!(matches!(call().await, Err(HostError::HandlerFailed { .. })));
    }
    assert!(matches!(call().await, Err(HostError::CircuitOpen { .. })));
    assert_eq!(cache.calls(), 5);
    assert_eq!(host.health().state, LifecycleState::Degraded);

    cache.set_failing(false);
    tokio::time::advance(Duration::from_millis(10_001)).await;
    call().await.unwrap();
    assert_eq!(cache.calls(), 6);
    assert_eq!(host.health().state, LifecycleState::Running);
}

#[tokio::test]
async fn test_optional_handler_degrades_node() {
    let degrading = VECTOR_INDEX_EFFECT.replace("on_missing: warn_and_skip", "on_missing: degrade");
    let host = HostBuilder::new(HostConfig::default())
        .handler(Arc::new(InMemoryVectorStore::new()))
        .contract_str(degrading)
        .boot(idle_source())
        .await
        .unwrap();

    assert_eq!(host.state(), LifecycleState::Degraded);
    assert_eq!(
        host.node_status("vector_index_effect"),
        Some(&NodeStatus::Degraded {
            missing: vec!["cache".to_string()]
        })
    );

    let err = host
        .dispatch(Envelope::new(
            "vector_index_effect",
            json!({"handler": "cache", "operation": "get", "input": {"key": "k"}}),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "HANDLER_UNAVAILABLE");

    let report = host
        .dispatch(Envelope::new(
            "vector_index_effect",
            json!({"handler": "vector_store", "operation": "upsert", "input": {"id": "d", "embedding": [1.0]}}),
        ))
        .await
        .unwrap();
    assert!(report.degraded);
    assert_eq!(report.output, json!({"stored": true}));
}

// =========================================================================
// Flows
// =========================================================================

#[tokio::test]
async fn test_reducer_triggers_workflow() {
    let (stores, handlers) = stores();
    let index = Arc::new(IndexNode::new());
    let host = ingestion_builder(handlers, index.clone())
        .boot(idle_source())
        .await
        .unwrap();
    assert_eq!(host.state(), LifecycleState::Running);

    let report = host.dispatch(parse_completed("doc-1", "hello vector world")).await.unwrap();
    assert_eq!(report.output["new_state"], "PARSED");
    assert_eq!(report.intents.len(), 2);
    assert!(report.intents.iter().all(|o| o.is_executed()));
    assert_eq!(stores.state.current("INGESTION", "doc-1").await.as_deref(), Some("PARSED"));

    let trigger = &report.intents[1];
    assert_eq!(trigger.intent_type, IntentType::WorkflowTrigger);

    let pending = host.dispatch_pending().await;
    assert_eq!(pending.len(), 1);
    let workflow = pending.into_iter().next().unwrap().unwrap();
    assert_eq!(workflow.envelope_id, trigger.intent_id);
    assert_eq!(workflow.output["status"], "completed");
    assert_eq!(stores.vectors.count().await, 1);
    assert_eq!(index.calls.load(Ordering::SeqCst), 1);

    // The row now says PARSED, so the same event is rejected
    let err = host.dispatch(parse_completed("doc-1", "again")).await.unwrap_err();
    assert_eq!(err.code(), "FSM_TRANSITION");
}

#[tokio::test]
async fn test_stale_state_update_is_reported() {
    let (stores, handlers) = stores();
    let host = ingestion_builder(handlers, Arc::new(IndexNode::new()))
        .boot(idle_source())
        .await
        .unwrap();
    host.dispatch(parse_completed("doc-2", "first")).await.unwrap();

    // Caller claims an older state than the one stored
    let stale = Envelope::new(
        "ingestion_reducer",
        json!({"entity_id": "doc-2", "event": "PARSE_COMPLETED", "current_state": "RECEIVED"}),
    );
    let report = host.dispatch(stale).await.unwrap();
    match &report.intents[0].status {
        IntentStatus::Failed { code, error } => {
            assert_eq!(*code, "HANDLER_FAILED");
            assert!(error.contains("stale write"));
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(stores.state.current("INGESTION", "doc-2").await.as_deref(), Some("PARSED"));
}

#[tokio::test]
async fn test_redelivered_envelope_runs_once() {
    let (stores, handlers) = stores();
    let host = ingestion_builder(handlers, Arc::new(IndexNode::new()))
        .boot(idle_source())
        .await
        .unwrap();
    let envelope = parse_completed("doc-3", "once");

    let first = host.dispatch(envelope.clone()).await.unwrap();
    let second = host.dispatch(envelope).await.unwrap();
    assert!(second.duplicate);
    assert_eq!(second.output, first.output);
    assert_eq!(stores.state.current("INGESTION", "doc-3").await.as_deref(), Some("PARSED"));
    assert_eq!(host.health().metrics.envelopes_duplicate, 1);
}

/// Counts executions and holds each one long enough for a redelivery to race it
struct CountingNode {
    calls: AtomicU32,
}

#[async_trait]
impl NodeBehavior for CountingNode {
    async fn execute(&self, _ctx: NodeContext<'_>, input: NodeInput) -> Result<NodeOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(NodeOutput::payload(json!({"call": call, "input": input.payload})))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_redelivery_runs_once() {
    let mut config = HostConfig::default();
    config.runtime.max_workers = None;
    let counter = Arc::new(CountingNode {
        calls: AtomicU32::new(0),
    });
    let host = HostBuilder::new(config)
        .contract_str(PARSER_COMPUTE)
        .behavior("document_parser_compute", counter.clone())
        .boot(idle_source())
        .await
        .unwrap();
    let envelope = Envelope::new("document_parser_compute", json!({"data": {"text": "twice"}}));

    let (a, b) = tokio::join!(host.dispatch(envelope.clone()), host.dispatch(envelope));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    assert!(a.duplicate != b.duplicate);
    assert_eq!(a.output, b.output);
    assert_eq!(host.health().metrics.envelopes_duplicate, 1);
}

#[tokio::test]
async fn test_failed_step_compensates_once() {
    let (_stores, handlers) = stores();
    let index = Arc::new(IndexNode {
        calls: AtomicU32::new(0),
        fail_index: true,
        fail_delete: true,
    });
    let host = ingestion_builder(handlers, index.clone())
        .boot(idle_source())
        .await
        .unwrap();

    let err = host
        .dispatch(Envelope::new(
            "ingestion_orchestrator",
            json!({"entity_id": "doc-4", "data": {"text": "broken"}}),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::WorkflowFailed { ref step, .. } if step == "index"));

    // One failed index attempt plus one compensation attempt
    assert_eq!(index.calls.load(Ordering::SeqCst), 2);
    let leases = host.orchestrator().leases();
    assert_eq!(leases.active_count(), 0);
    assert_eq!(leases.acquired_count(), 1);
    assert_eq!(leases.released_count(), 1);

    let health = host.health();
    assert_eq!(health.unresolved_workflows.len(), 1);
    assert_eq!(health.unresolved_workflows[0].failed_step.as_deref(), Some("index"));
    assert_eq!(health.metrics.workflows_unresolved, 1);
}

#[tokio::test]
async fn test_compensation_success() {
    let (stores, handlers) = stores();
    let index = Arc::new(IndexNode {
        calls: AtomicU32::new(0),
        fail_index: true,
        fail_delete: false,
    });
    let host = ingestion_builder(handlers, index)
        .boot(idle_source())
        .await
        .unwrap();
    let engine = host.orchestrator().clone();

    let result = host
        .dispatch(Envelope::new(
            "ingestion_orchestrator",
            json!({"entity_id": "doc-5", "data": {"text": "fine"}}),
        ))
        .await;
    assert!(result.is_err());
    assert!(engine.unresolved().is_empty());
    assert_eq!(stores.vectors.count().await, 0);
    assert_eq!(host.health().metrics.workflows_compensated, 1);
}

#[tokio::test]
async fn test_run_routes_source_and_reentries() {
    let (stores, handlers) = stores();
    let (tx, source) = InMemoryEventSource::channel(16);
    let host = ingestion_builder(handlers, Arc::new(IndexNode::new()))
        .boot(Box::new(source))
        .await
        .unwrap();

    tx.send(parse_completed("doc-6", "routed through the loop").with_source_topic("ingestion.events"))
        .await
        .unwrap();
    tx.send(parse_completed("doc-7", "unsubscribed topic").with_source_topic("other.events"))
        .await
        .unwrap();
    drop(tx);

    let summary = host.run(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.received, 1);
    assert_eq!(summary.reentered, 1);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(stores.vectors.count().await, 1);
    assert_eq!(stores.state.current("INGESTION", "doc-7").await, None);

    host.shutdown().await.unwrap();
    assert_eq!(host.state(), LifecycleState::Stopped);
}

// =========================================================================
// Concurrency
// =========================================================================

/// Tracks how many executions overlap
struct OverlapTracker {
    active: AtomicU32,
    peak: AtomicU32,
}

#[async_trait]
impl NodeBehavior for OverlapTracker {
    async fn execute(&self, _ctx: NodeContext<'_>, input: NodeInput) -> Result<NodeOutput> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(NodeOutput::payload(input.payload))
    }
}

async fn peak_concurrency(policy: &str) -> u32 {
    let contract = format!(
        "node_id: overlap_compute\nversion: 1.0.0\nkind: COMPUTE\nconcurrency: {}\n",
        policy
    );
    let mut config = HostConfig::default();
    config.runtime.max_workers = None;
    let tracker = Arc::new(OverlapTracker {
        active: AtomicU32::new(0),
        peak: AtomicU32::new(0),
    });
    let host: RuntimeHost = HostBuilder::new(config)
        .contract_str(contract)
        .behavior("overlap_compute", tracker.clone())
        .boot(idle_source())
        .await
        .unwrap();

    let dispatches = (0..8).map(|i| host.dispatch(Envelope::new("overlap_compute", json!(i))));
    for result in join_all(dispatches).await {
        result.unwrap();
    }
    tracker.peak.load(Ordering::SeqCst)
}

#[tokio::test(start_paused = true)]
async fn test_strictly_sequential_never_overlaps() {
    assert_eq!(peak_concurrency("strictly_sequential").await, 1);
    assert_eq!(peak_concurrency("sequential").await, 1);
    assert!(peak_concurrency("parallelizable").await > 1);
}
