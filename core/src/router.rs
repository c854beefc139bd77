//! Envelope routing
//!
//! Resolves the target node of each envelope, runs it on the scheduler lane
//! its concurrency policy selects, enforces the intent rules for its kind
//! and hands returned intents to the [`IntentRouter`]. Failed envelopes are
//! retried with backoff when the error is retryable; successfully processed
//! envelope ids are remembered so that a redelivery is not executed twice.
//! An envelope id is reserved before its node runs, so a redelivery that
//! arrives while the first copy is still running waits for its outcome.

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::contract::NodeKind;
use crate::envelope::Envelope;
use crate::error::{HostError, Result};
use crate::handler::HandlerRegistry;
use crate::intent_router::{IntentOutcome, IntentRouter};
use crate::node::{NodeContext, NodeInstance, NodeInvoker, NodeOutput};
use crate::retry::{retry_async, RetryConfig};
use crate::scheduler::ConcurrencyScheduler;
use crate::telemetry::Telemetry;
use crate::transport::EventSource;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub retry: RetryConfig,
    /// Remembered envelope ids; 0 disables deduplication
    pub dedup_capacity: usize,
    /// Budget for each handler call made on behalf of an intent
    pub intent_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            dedup_capacity: 10_000,
            intent_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of dispatching one envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub envelope_id: Uuid,
    pub node_id: String,
    pub output: Value,
    pub intents: Vec<IntentOutcome>,
    pub attempts: u32,
    /// Already processed; served from the dedup cache
    pub duplicate: bool,
    pub degraded: bool,
}

/// Totals for one `run`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingSummary {
    pub received: u64,
    pub reentered: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub duplicates: u64,
}

impl RoutingSummary {
    fn record(&mut self, result: &Result<DispatchReport>) {
        match result {
            Ok(report) if report.duplicate => self.duplicates += 1,
            Ok(_) => self.succeeded += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Bounded FIFO of processed envelopes plus the ids currently running
#[derive(Debug)]
struct DedupCache {
    capacity: usize,
    order: VecDeque<Uuid>,
    reports: HashMap<Uuid, DispatchReport>,
    in_flight: HashMap<Uuid, watch::Receiver<()>>,
}

enum Claim {
    Cached(DispatchReport),
    /// Another dispatch owns the id; resolves when it finishes
    Wait(watch::Receiver<()>),
    Owner(watch::Sender<()>),
    Untracked,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            reports: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    fn claim(&mut self, envelope_id: Uuid) -> Claim {
        if self.capacity == 0 {
            return Claim::Untracked;
        }
        if let Some(report) = self.reports.get(&envelope_id) {
            return Claim::Cached(report.clone());
        }
        if let Some(done) = self.in_flight.get(&envelope_id) {
            return Claim::Wait(done.clone());
        }
        let (tx, rx) = watch::channel(());
        self.in_flight.insert(envelope_id, rx);
        Claim::Owner(tx)
    }

    fn insert(&mut self, report: DispatchReport) {
        if self.capacity == 0 || self.reports.contains_key(&report.envelope_id) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.reports.remove(&oldest);
            }
        }
        self.order.push_back(report.envelope_id);
        self.reports.insert(report.envelope_id, report);
    }
}

/// Releases an envelope reservation; waiters wake when the sender drops
struct InFlight {
    inner: Arc<RouterInner>,
    envelope_id: Uuid,
    _done: watch::Sender<()>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.dedup.lock().in_flight.remove(&self.envelope_id);
    }
}

struct Processed {
    output: NodeOutput,
    outcomes: Vec<IntentOutcome>,
}

struct RouterInner {
    nodes: HashMap<String, Arc<NodeInstance>>,
    unavailable: HashMap<String, String>,
    scheduler: Arc<ConcurrencyScheduler>,
    intents: IntentRouter,
    retry: RetryConfig,
    dedup: Mutex<DedupCache>,
    reentry: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    telemetry: Telemetry,
}

impl RouterInner {
    fn instance(&self, node_id: &str) -> Result<Arc<NodeInstance>> {
        if let Some(instance) = self.nodes.get(node_id) {
            return Ok(instance.clone());
        }
        match self.unavailable.get(node_id) {
            Some(reason) => Err(HostError::NodeUnavailable {
                node_id: node_id.to_string(),
                reason: reason.clone(),
            }),
            None => Err(HostError::UnknownNode {
                node_id: node_id.to_string(),
            }),
        }
    }

    /// Execute the node and route its intents
    async fn process(&self, envelope: &Envelope) -> Result<Processed> {
        let instance = self.instance(&envelope.node_id)?;
        let input = envelope.to_node_input();
        let output = instance
            .behavior()
            .execute(NodeContext::new(&instance, self), input.clone())
            .await?;

        let kind = instance.metadata().kind();
        if !output.intents.is_empty() && !kind.may_emit_intents() {
            return Err(HostError::IntentNotPermitted {
                node_id: envelope.node_id.clone(),
                kind: kind.to_string(),
                count: output.intents.len(),
            });
        }

        let outcomes = self.intents.route_batch(output.intents.clone(), &input).await;
        Ok(Processed { output, outcomes })
    }
}

#[async_trait::async_trait]
impl NodeInvoker for RouterInner {
    /// Inline dispatch for orchestrator steps: no dedup, no retry
    async fn invoke(&self, envelope: Envelope) -> Result<NodeOutput> {
        envelope.check_version()?;
        self.instance(&envelope.node_id)?;
        let processed = self
            .scheduler
            .run_inline(&envelope.node_id, self.process(&envelope))
            .await??;
        Ok(processed.output)
    }
}

/// Cloneable routing front end
#[derive(Clone)]
pub struct EnvelopeRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for EnvelopeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeRouter")
            .field("nodes", &self.inner.nodes.len())
            .field("unavailable", &self.inner.unavailable.len())
            .finish()
    }
}

impl EnvelopeRouter {
    /// `unavailable` maps node ids that failed binding to the reason
    pub fn new(
        nodes: Vec<NodeInstance>,
        unavailable: HashMap<String, String>,
        scheduler: Arc<ConcurrencyScheduler>,
        handlers: Arc<HandlerRegistry>,
        settings: RouterSettings,
        telemetry: Telemetry,
    ) -> Self {
        let orchestrators: BTreeSet<String> = nodes
            .iter()
            .filter(|n| n.metadata().kind() == NodeKind::Orchestrator)
            .map(|n| n.node_id().to_string())
            .collect();
        let (reentry_tx, reentry_rx) = mpsc::unbounded_channel();
        let intents = IntentRouter::new(
            handlers,
            orchestrators,
            reentry_tx,
            settings.intent_timeout,
            telemetry.clone(),
        );

        Self {
            inner: Arc::new(RouterInner {
                nodes: nodes
                    .into_iter()
                    .map(|n| (n.node_id().to_string(), Arc::new(n)))
                    .collect(),
                unavailable,
                scheduler,
                intents,
                retry: settings.retry,
                dedup: Mutex::new(DedupCache::new(settings.dedup_capacity)),
                reentry: tokio::sync::Mutex::new(reentry_rx),
                telemetry,
            }),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<NodeInstance>> {
        self.inner.nodes.get(node_id).cloned()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.inner.nodes.keys().map(String::as_str)
    }

    /// Dispatch one envelope and wait for its report
    pub async fn dispatch(&self, envelope: Envelope) -> Result<DispatchReport> {
        envelope.check_version()?;
        let instance = self.inner.instance(&envelope.node_id)?;
        let envelope_id = envelope.envelope_id;

        // Failed dispatches are not cached, so a waiter may end up owning the retry
        let _reservation = loop {
            let claim = self.inner.dedup.lock().claim(envelope_id);
            match claim {
                Claim::Cached(mut cached) => {
                    tracing::debug!(%envelope_id, "duplicate envelope; not re-executed");
                    self.inner.telemetry.envelope_duplicate();
                    cached.duplicate = true;
                    return Ok(cached);
                }
                Claim::Wait(mut done) => {
                    tracing::debug!(%envelope_id, "envelope already in flight; waiting for it");
                    let _ = done.changed().await;
                }
                Claim::Owner(done) => {
                    break Some(InFlight {
                        inner: self.inner.clone(),
                        envelope_id,
                        _done: done,
                    })
                }
                Claim::Untracked => break None,
            }
        };

        let node_id = envelope.node_id.clone();
        let span = tracing::info_span!("dispatch", %envelope_id, %node_id);
        let started = Instant::now();
        let label = format!("envelope {}", envelope_id);

        let (result, attempts) = retry_async(&self.inner.retry, &label, |_| {
            let inner = self.inner.clone();
            let envelope = envelope.clone();
            async move {
                let worker = inner.clone();
                let lane = envelope.node_id.clone();
                let done = inner
                    .scheduler
                    .submit(&lane, async move { worker.process(&envelope).await })?;
                done.await.map_err(|_| HostError::SchedulerClosed)?
            }
        })
        .instrument(span)
        .await;

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.inner
            .telemetry
            .envelope_finished(envelope_id, &node_id, duration_ms, attempts, result.is_ok());

        let processed = match result {
            Ok(processed) => processed,
            Err(e) => {
                tracing::warn!(%envelope_id, %node_id, attempts, error = %e, "envelope failed");
                return Err(e);
            }
        };
        let report = DispatchReport {
            envelope_id,
            node_id,
            output: processed.output.payload,
            intents: processed.outcomes,
            attempts,
            duplicate: false,
            degraded: instance.is_degraded(),
        };
        self.inner.dedup.lock().insert(report.clone());
        Ok(report)
    }

    /// Dispatch envelopes re-entered by WORKFLOW_TRIGGER intents until none remain
    pub async fn dispatch_pending(&self) -> Vec<Result<DispatchReport>> {
        let mut results = Vec::new();
        loop {
            let next = self.inner.reentry.lock().await.try_recv();
            match next {
                Ok(envelope) => results.push(self.dispatch(envelope).await),
                Err(_) => return results,
            }
        }
    }

    /// Pull batches from `source` until it closes or `cancel` fires
    ///
    /// Re-entered envelopes are dispatched alongside source envelopes. On
    /// close the loop waits for in-flight work and pending re-entries.
    pub async fn run(&self, source: &mut dyn EventSource, cancel: CancellationToken) -> Result<RoutingSummary> {
        let mut reentry = self.inner.reentry.lock().await;
        let mut in_flight = FuturesUnordered::new();
        let mut summary = RoutingSummary::default();
        let mut source_open = true;
        let mut source_error = None;

        loop {
            if !source_open && in_flight.is_empty() {
                match reentry.try_recv() {
                    Ok(envelope) => {
                        summary.reentered += 1;
                        in_flight.push(self.dispatch(envelope));
                        continue;
                    }
                    Err(_) => break,
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(in_flight = in_flight.len(), "routing cancelled");
                    break;
                }
                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    summary.record(&result);
                }
                Some(envelope) = reentry.recv() => {
                    summary.reentered += 1;
                    in_flight.push(self.dispatch(envelope));
                }
                batch = source.next_batch(), if source_open => match batch {
                    Ok(batch) if batch.is_empty() => {
                        tracing::info!("event source closed");
                        source_open = false;
                    }
                    Ok(batch) => {
                        summary.received += batch.len() as u64;
                        for envelope in batch {
                            in_flight.push(self.dispatch(envelope));
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "event source failed");
                        source_error = Some(e);
                        source_open = false;
                    }
                },
            }
        }

        while let Some(result) = in_flight.next().await {
            summary.record(&result);
        }
        tracing::info!(
            received = summary.received,
            succeeded = summary.succeeded,
            failed = summary.failed,
            duplicates = summary.duplicates,
            "routing finished"
        );
        match source_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::fixtures::PARSER_COMPUTE;
    use crate::contract::{Contract, NodeMetadata};
    use crate::intent::{Intent, IntentType};
    use crate::envelope::NodeInput;
    use crate::node::{ComputeNode, NodeBehavior, NodeBinder};
    use crate::transport::InMemoryEventSource;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with a retryable error until `failures` attempts have been made
    struct FlakyNode {
        calls: AtomicU32,
        failures: u32,
        intents: bool,
    }

    #[async_trait]
    impl NodeBehavior for FlakyNode {
        async fn execute(&self, ctx: NodeContext<'_>, input: NodeInput) -> Result<NodeOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(HostError::HandlerFailed {
                    handler_type: "cache".to_string(),
                    operation: "get".to_string(),
                    message: "connection reset".to_string(),
                    retryable: true,
                });
            }
            let mut output = NodeOutput::payload(json!({"call": call, "node": ctx.node_id()}));
            if self.intents {
                output.intents = vec![Intent::new(IntentType::Log, "host", json!({"message": "hi"}), input.correlation_id)];
            }
            Ok(output)
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyNode> {
        Arc::new(FlakyNode {
            calls: AtomicU32::new(0),
            failures,
            intents: false,
        })
    }

    fn router(nodes: Vec<(&str, Arc<dyn NodeBehavior>)>, retry: RetryConfig) -> EnvelopeRouter {
        let registry = Arc::new(HandlerRegistry::new());
        let binder = NodeBinder::new(registry.clone());
        let instances: Vec<NodeInstance> = nodes
            .into_iter()
            .map(|(yaml, behavior)| {
                let meta = NodeMetadata::from_contract(Contract::from_yaml(yaml).unwrap()).unwrap();
                binder.bind(Arc::new(meta), behavior).unwrap()
            })
            .collect();
        let policies = instances
            .iter()
            .map(|n| (n.node_id().to_string(), n.metadata().concurrency()))
            .collect();
        let scheduler = Arc::new(ConcurrencyScheduler::new(Some(1), policies));
        scheduler.start().unwrap();
        EnvelopeRouter::new(
            instances,
            HashMap::from([("ghost_effect".to_string(), "vector_store missing".to_string())]),
            scheduler,
            registry,
            RouterSettings {
                retry,
                ..Default::default()
            },
            Telemetry::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_is_retried() {
        let node = flaky(2);
        let router = router(vec![(PARSER_COMPUTE, node.clone() as Arc<dyn NodeBehavior>)], RetryConfig::default());
        let report = router
            .dispatch(Envelope::new("document_parser_compute", json!({})))
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(report.output["call"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_bounded() {
        let node = flaky(10);
        let retry = RetryConfig {
            max_retries: 2,
            ..Default::default()
        };
        let router = router(vec![(PARSER_COMPUTE, node.clone() as Arc<dyn NodeBehavior>)], retry);
        let err = router
            .dispatch(Envelope::new("document_parser_compute", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(node.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_duplicate_envelope_is_not_reexecuted() {
        let node = flaky(0);
        let router = router(vec![(PARSER_COMPUTE, node.clone() as Arc<dyn NodeBehavior>)], RetryConfig::no_retry());
        let envelope = Envelope::new("document_parser_compute", json!({}));

        let first = router.dispatch(envelope.clone()).await.unwrap();
        let second = router.dispatch(envelope).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.output, first.output);
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compute_node_may_not_emit_intents() {
        let node = Arc::new(FlakyNode {
            calls: AtomicU32::new(0),
            failures: 0,
            intents: true,
        });
        let router = router(vec![(PARSER_COMPUTE, node as Arc<dyn NodeBehavior>)], RetryConfig::no_retry());
        let err = router
            .dispatch(Envelope::new("document_parser_compute", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::IntentNotPermitted { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_unknown_and_unavailable_nodes() {
        let router = router(vec![], RetryConfig::no_retry());
        let err = router.dispatch(Envelope::new("nobody_compute", json!({}))).await.unwrap_err();
        assert!(matches!(err, HostError::UnknownNode { .. }));
        let err = router.dispatch(Envelope::new("ghost_effect", json!({}))).await.unwrap_err();
        assert!(matches!(err, HostError::NodeUnavailable { .. }));

        let mut stale = Envelope::new("nobody_compute", json!({}));
        stale.envelope_version = "2.0.0".to_string();
        assert!(matches!(
            router.dispatch(stale).await,
            Err(HostError::EnvelopeVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_until_source_closes() {
        let upper: Arc<dyn NodeBehavior> = Arc::new(ComputeNode::new(|v: &Value| {
            v.as_str()
                .map(|s| json!(s.to_uppercase()))
                .ok_or_else(|| "expected a string".to_string())
        }));
        let router = router(vec![(PARSER_COMPUTE, upper)], RetryConfig::no_retry());
        let (tx, mut source) = InMemoryEventSource::channel(8);

        tx.send(Envelope::new("document_parser_compute", json!("a"))).await.unwrap();
        tx.send(Envelope::new("document_parser_compute", json!(1))).await.unwrap();
        tx.send(Envelope::new("nobody_compute", json!("c"))).await.unwrap();
        drop(tx);

        let summary = router.run(&mut source, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.received, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
    }

    #[test]
    fn test_dedup_cache_evicts_oldest() {
        let mut cache = DedupCache::new(2);
        let report = |id: Uuid| DispatchReport {
            envelope_id: id,
            node_id: "x_compute".to_string(),
            output: Value::Null,
            intents: vec![],
            attempts: 1,
            duplicate: false,
            degraded: false,
        };
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            cache.insert(report(*id));
        }
        assert!(matches!(cache.claim(ids[0]), Claim::Owner(_)));
        assert!(matches!(cache.claim(ids[1]), Claim::Cached(_)));
        assert!(matches!(cache.claim(ids[2]), Claim::Cached(_)));
    }

    #[test]
    fn test_dedup_cache_reserves_running_ids() {
        let mut cache = DedupCache::new(4);
        let id = Uuid::new_v4();
        let owner = cache.claim(id);
        assert!(matches!(owner, Claim::Owner(_)));
        assert!(matches!(cache.claim(id), Claim::Wait(_)));

        cache.in_flight.remove(&id);
        drop(owner);
        assert!(matches!(cache.claim(id), Claim::Owner(_)));
        assert!(matches!(DedupCache::new(0).claim(id), Claim::Untracked));
    }

    #[tokio::test]
    async fn test_redelivery_in_one_batch_runs_once() {
        let node = flaky(0);
        let router = router(vec![(PARSER_COMPUTE, node.clone() as Arc<dyn NodeBehavior>)], RetryConfig::no_retry());
        let (tx, mut source) = InMemoryEventSource::channel(8);
        let envelope = Envelope::new("document_parser_compute", json!({}));
        tx.send(envelope.clone()).await.unwrap();
        tx.send(envelope).await.unwrap();
        drop(tx);

        let summary = router.run(&mut source, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.received, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_retries_after_failed_owner() {
        let node = flaky(1);
        let router = router(vec![(PARSER_COMPUTE, node.clone() as Arc<dyn NodeBehavior>)], RetryConfig::no_retry());
        let envelope = Envelope::new("document_parser_compute", json!({}));

        let (first, second) = tokio::join!(router.dispatch(envelope.clone()), router.dispatch(envelope));
        assert!(first.is_err());
        let second = second.unwrap();
        assert!(!second.duplicate);
        assert_eq!(node.calls.load(Ordering::SeqCst), 2);
    }
}
