//! Runtime host
//!
//! Owns the boot sequence and the lifecycle state machine. Everything the
//! runtime needs is built here, bottom-up and once: configuration, the
//! contract store, the handler registry, bound node instances, the
//! scheduler and the router. After boot nothing is registered or replaced.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{HostConfig, ProfileConfig};
use crate::contract::{ContractStore, NodeKind, NodeMetadata, Subscription};
use crate::envelope::Envelope;
use crate::error::{HostError, Result};
use crate::handler::{BreakerMetrics, CircuitState, Handler, HandlerRegistry};
use crate::node::{
    ComputeNode, HandlerCallNode, NodeBehavior, NodeBinder, NodeInstance, NodeStatus, OrchestratorNode, ReducerNode,
};
use crate::orchestrator::{OrchestratorEngine, UnresolvedWorkflow};
use crate::reducer::ReducerEngine;
use crate::retry::retry_async;
use crate::router::{DispatchReport, EnvelopeRouter, RouterSettings, RoutingSummary};
use crate::scheduler::ConcurrencyScheduler;
use crate::telemetry::{HostEvent, MetricsSnapshot, Telemetry};
use crate::transport::EventSource;

/// Host lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Initializing,
    Validating,
    Binding,
    Running,
    Degraded,
    Error,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Initializing, Validating)
                | (Validating, Binding)
                | (Validating, Error)
                | (Binding, Running)
                | (Binding, Degraded)
                | (Binding, Error)
                | (Running, Degraded)
                | (Degraded, Running)
                | (Running, Stopping)
                | (Degraded, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Whether envelopes are accepted
    pub fn is_serving(self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Degraded)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Initializing => "INITIALIZING",
            LifecycleState::Validating => "VALIDATING",
            LifecycleState::Binding => "BINDING",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Degraded => "DEGRADED",
            LifecycleState::Error => "ERROR",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: Mutex<LifecycleState>,
    telemetry: Telemetry,
}

impl Lifecycle {
    fn new(telemetry: Telemetry) -> Self {
        Self {
            state: Mutex::new(LifecycleState::Initializing),
            telemetry,
        }
    }

    fn get(&self) -> LifecycleState {
        *self.state.lock()
    }

    fn transition(&self, to: LifecycleState) -> Result<()> {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(HostError::InvalidLifecycle {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            *state = to;
            from
        };
        tracing::info!(%from, %to, "lifecycle transition");
        self.telemetry.emit(HostEvent::LifecycleChanged { from, to });
        Ok(())
    }

    /// Move to ERROR and wrap `err` as a boot abort
    fn abort(&self, stage: &str, err: HostError) -> HostError {
        tracing::error!(stage, error = %err, "boot aborted");
        if let Err(e) = self.transition(LifecycleState::Error) {
            tracing::debug!(error = %e, "lifecycle already past boot");
        }
        match err {
            HostError::BootAborted { .. } => err,
            other => HostError::BootAborted {
                stage: stage.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Everything observable about a running host
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: LifecycleState,
    pub nodes: BTreeMap<String, NodeStatus>,
    pub breakers: BTreeMap<String, BreakerMetrics>,
    pub metrics: MetricsSnapshot,
    pub unresolved_workflows: Vec<UnresolvedWorkflow>,
}

/// Collects what the host is built from, then boots it
pub struct HostBuilder {
    config: HostConfig,
    handlers: Vec<Arc<dyn Handler>>,
    behaviors: HashMap<String, Arc<dyn NodeBehavior>>,
    contract_docs: Vec<String>,
    contract_dirs: Vec<PathBuf>,
    reducer: Option<ReducerEngine>,
    telemetry: Option<Telemetry>,
}

impl fmt::Debug for HostBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuilder")
            .field("handlers", &self.handlers.iter().map(|h| h.handler_type().to_string()).collect::<Vec<_>>())
            .field("behaviors", &self.behaviors.keys().collect::<Vec<_>>())
            .field("contract_docs", &self.contract_docs.len())
            .field("contract_dirs", &self.contract_dirs)
            .finish()
    }
}

impl HostBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            behaviors: HashMap::new(),
            contract_docs: Vec::new(),
            contract_dirs: Vec::new(),
            reducer: None,
            telemetry: None,
        }
    }

    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn Handler>>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Custom behaviour for one node; replaces the kind's default
    pub fn behavior(mut self, node_id: impl Into<String>, behavior: Arc<dyn NodeBehavior>) -> Self {
        self.behaviors.insert(node_id.into(), behavior);
        self
    }

    /// Pure function for a COMPUTE node
    pub fn compute<F>(self, node_id: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&serde_json::Value) -> std::result::Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.behavior(node_id, Arc::new(ComputeNode::new(compute)))
    }

    /// Contract document loaded after `runtime.contracts_dir` and any `contract_dir`
    pub fn contract_str(mut self, yaml: impl Into<String>) -> Self {
        self.contract_docs.push(yaml.into());
        self
    }

    pub fn contract_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.contract_dirs.push(dir.into());
        self
    }

    /// Replace the built-in FSM tables
    pub fn reducer_engine(mut self, engine: ReducerEngine) -> Self {
        self.reducer = Some(engine);
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Run the boot sequence
    ///
    /// Configuration, contract and handler failures abort boot with
    /// `BootAborted`. A node that fails binding is reported as ERROR and
    /// the host comes up DEGRADED.
    pub async fn boot(self, source: Box<dyn EventSource>) -> Result<RuntimeHost> {
        let telemetry = self
            .telemetry
            .clone()
            .unwrap_or_else(|| Telemetry::new(self.config.runtime.telemetry_capacity));
        let lifecycle = Arc::new(Lifecycle::new(telemetry.clone()));
        lifecycle.transition(LifecycleState::Validating)?;

        self.config.validate().map_err(|e| lifecycle.abort("load config", e))?;
        let contracts = self.load_contracts().map_err(|e| lifecycle.abort("load contracts", e))?;
        let selected = self.select_nodes(&contracts).map_err(|e| lifecycle.abort("validate", e))?;
        let reducer = match self.reducer {
            Some(ref engine) => engine.clone(),
            None => ReducerEngine::with_builtin().map_err(|e| lifecycle.abort("validate", e))?,
        };
        validate_references(&selected, &reducer).map_err(|e| lifecycle.abort("validate", e))?;

        lifecycle.transition(LifecycleState::Binding)?;
        let registry = self
            .build_registry(&telemetry)
            .await
            .map_err(|e| lifecycle.abort("initialize handlers", e))?;

        let reducer = Arc::new(reducer);
        let orchestrator = Arc::new(
            OrchestratorEngine::new(self.config.orchestrator.clone()).with_telemetry(telemetry.clone()),
        );
        let binder = NodeBinder::new(registry.clone());

        let mut instances = Vec::new();
        let mut unavailable = HashMap::new();
        let mut statuses = BTreeMap::new();
        for meta in &selected {
            let bound = self
                .behavior_for(meta, &reducer, &orchestrator)
                .and_then(|behavior| binder.bind(meta.clone(), behavior));
            match bound {
                Ok(instance) => {
                    telemetry.emit(HostEvent::NodeBound {
                        node_id: meta.node_id().to_string(),
                        degraded: instance.is_degraded(),
                    });
                    statuses.insert(meta.node_id().to_string(), instance.status());
                    instances.push(instance);
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::error!(node_id = %meta.node_id(), error = %reason, "node failed binding");
                    telemetry.emit(HostEvent::NodeBindingFailed {
                        node_id: meta.node_id().to_string(),
                        reason: reason.clone(),
                    });
                    statuses.insert(meta.node_id().to_string(), NodeStatus::Error { reason: reason.clone() });
                    unavailable.insert(meta.node_id().to_string(), reason);
                }
            }
        }
        let boot_degraded = !unavailable.is_empty() || instances.iter().any(NodeInstance::is_degraded);

        let subscriptions = collect_subscriptions(&instances);
        let boot_retry = self.config.runtime.boot_retry.clone();
        let src: &dyn EventSource = &*source;
        let subs: &[Subscription] = &subscriptions;
        let (subscribed, attempts) = retry_async(&boot_retry, "subscribe", move |_| src.subscribe(subs)).await;
        subscribed.map_err(|e| lifecycle.abort("subscribe", e))?;
        tracing::info!(topics = subscriptions.len(), attempts, "subscribed");

        let policies = instances
            .iter()
            .map(|n| (n.node_id().to_string(), n.metadata().concurrency()))
            .collect();
        let scheduler = Arc::new(ConcurrencyScheduler::new(self.config.runtime.max_workers, policies));
        let (started, _) = retry_async(&boot_retry, "start workers", |_| {
            let scheduler = scheduler.clone();
            async move { scheduler.start() }
        })
        .await;
        started.map_err(|e| lifecycle.abort("start workers", e))?;

        let router = EnvelopeRouter::new(
            instances,
            unavailable,
            scheduler.clone(),
            registry.clone(),
            RouterSettings {
                retry: self.config.runtime.envelope_retry.clone(),
                dedup_capacity: self.config.runtime.dedup_capacity,
                intent_timeout: Duration::from_millis(self.config.runtime.intent_timeout_ms),
            },
            telemetry.clone(),
        );

        let mut contracts = contracts;
        contracts.freeze();
        let breaker_events = telemetry.subscribe();
        lifecycle.transition(if boot_degraded {
            LifecycleState::Degraded
        } else {
            LifecycleState::Running
        })?;
        let health_watch = CancellationToken::new();
        tokio::spawn(watch_breakers(
            lifecycle.clone(),
            registry.clone(),
            boot_degraded,
            breaker_events,
            health_watch.clone(),
        ));

        Ok(RuntimeHost {
            lifecycle,
            boot_degraded,
            contracts: Arc::new(contracts),
            registry,
            scheduler,
            router,
            orchestrator,
            statuses,
            source: tokio::sync::Mutex::new(source),
            telemetry,
            health_watch,
        })
    }

    fn load_contracts(&self) -> Result<ContractStore> {
        let mut store = ContractStore::new().strict(self.config.runtime.strict_fingerprints);
        let dirs = self.config.runtime.contracts_dir.iter().chain(self.contract_dirs.iter());
        for dir in dirs {
            store.load_dir(dir)?;
        }
        for doc in &self.contract_docs {
            store.load_str(doc)?;
        }
        Ok(store)
    }

    /// Nodes chosen by the active profile, or all of them
    fn select_nodes(&self, store: &ContractStore) -> Result<Vec<Arc<NodeMetadata>>> {
        let profile: Option<&ProfileConfig> = self.config.active_profile()?;
        let mut selected: Vec<Arc<NodeMetadata>> = store
            .iter()
            .filter(|meta| profile.map_or(true, |p| p.selects(meta.node_id(), meta.profile_tags())))
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.node_id().cmp(b.node_id()));

        if let (Some(name), Some(profile)) = (&self.config.runtime.profile, profile) {
            for wanted in &profile.nodes {
                if store.get(wanted).is_none() {
                    return Err(HostError::InvalidConfig {
                        message: format!("profile {} names unknown node {}", name, wanted),
                    });
                }
            }
            tracing::info!(profile = %name, nodes = selected.len(), of = store.len(), "applied profile");
        }
        Ok(selected)
    }

    async fn build_registry(&self, telemetry: &Telemetry) -> Result<Arc<HandlerRegistry>> {
        let mut registry = HandlerRegistry::new()
            .with_breakers(self.config.breaker.clone())
            .with_telemetry(telemetry.clone());
        for handler in &self.handlers {
            registry.register(handler.clone())?;
        }
        registry
            .initialize_all(|handler_type| self.config.handler_settings(handler_type))
            .await?;
        Ok(Arc::new(registry))
    }

    fn behavior_for(
        &self,
        meta: &NodeMetadata,
        reducer: &Arc<ReducerEngine>,
        orchestrator: &Arc<OrchestratorEngine>,
    ) -> Result<Arc<dyn NodeBehavior>> {
        if let Some(behavior) = self.behaviors.get(meta.node_id()) {
            return Ok(behavior.clone());
        }
        match meta.kind() {
            NodeKind::Effect => Ok(Arc::new(HandlerCallNode)),
            NodeKind::Reducer => Ok(Arc::new(ReducerNode::new(reducer.clone()))),
            NodeKind::Orchestrator => Ok(Arc::new(OrchestratorNode::new(orchestrator.clone()))),
            NodeKind::Compute => Err(HostError::NodeUnavailable {
                node_id: meta.node_id().to_string(),
                reason: "no compute function registered".to_string(),
            }),
        }
    }
}

/// Cross-contract checks that a single document cannot make
fn validate_references(selected: &[Arc<NodeMetadata>], reducer: &ReducerEngine) -> Result<()> {
    for meta in selected {
        if let Some(fsm_type) = meta.fsm_type() {
            reducer.definition(fsm_type).map_err(|e| HostError::contract(meta.node_id(), e.to_string()))?;
        }
        for workflow in meta.workflows() {
            for step in workflow.steps.iter().chain(workflow.compensation.iter()) {
                if !selected.iter().any(|m| m.node_id() == step.node_id) {
                    return Err(HostError::contract(
                        meta.node_id(),
                        format!(
                            "workflow {} step {} targets {} which is not loaded",
                            workflow.name, step.id, step.node_id
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn collect_subscriptions(instances: &[NodeInstance]) -> Vec<Subscription> {
    let mut subscriptions: Vec<Subscription> = Vec::new();
    for sub in instances.iter().flat_map(|n| n.metadata().subscriptions()) {
        if !subscriptions.contains(sub) {
            subscriptions.push(sub.clone());
        }
    }
    subscriptions
}

/// A booted host
pub struct RuntimeHost {
    lifecycle: Arc<Lifecycle>,
    boot_degraded: bool,
    contracts: Arc<ContractStore>,
    registry: Arc<HandlerRegistry>,
    scheduler: Arc<ConcurrencyScheduler>,
    router: EnvelopeRouter,
    orchestrator: Arc<OrchestratorEngine>,
    statuses: BTreeMap<String, NodeStatus>,
    source: tokio::sync::Mutex<Box<dyn EventSource>>,
    telemetry: Telemetry,
    health_watch: CancellationToken,
}

impl Drop for RuntimeHost {
    fn drop(&mut self) {
        self.health_watch.cancel();
    }
}

impl fmt::Debug for RuntimeHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHost")
            .field("state", &self.state())
            .field("nodes", &self.statuses)
            .finish()
    }
}

impl RuntimeHost {
    pub fn builder(config: HostConfig) -> HostBuilder {
        HostBuilder::new(config)
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.get()
    }

    pub fn contracts(&self) -> &Arc<ContractStore> {
        &self.contracts
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &EnvelopeRouter {
        &self.router
    }

    pub fn orchestrator(&self) -> &Arc<OrchestratorEngine> {
        &self.orchestrator
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<HostEvent> {
        self.telemetry.subscribe()
    }

    pub fn node_status(&self, node_id: &str) -> Option<&NodeStatus> {
        self.statuses.get(node_id)
    }

    pub fn nodes(&self) -> &BTreeMap<String, NodeStatus> {
        &self.statuses
    }

    pub async fn dispatch(&self, envelope: Envelope) -> Result<DispatchReport> {
        self.ensure_serving()?;
        self.router.dispatch(envelope).await
    }

    /// Dispatch envelopes re-entered by workflow triggers
    pub async fn dispatch_pending(&self) -> Vec<Result<DispatchReport>> {
        self.router.dispatch_pending().await
    }

    /// Route from the event source until it closes or `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<RoutingSummary> {
        self.ensure_serving()?;
        let mut source = self.source.lock().await;
        self.router.run(&mut **source, cancel).await
    }

    /// Snapshot health
    ///
    /// The RUNNING/DEGRADED state is kept current by the breaker watcher;
    /// this re-evaluates it as well so a report never trails its own breakers.
    pub fn health(&self) -> HealthReport {
        let breakers = self.registry.breaker_metrics();
        refresh_health(&self.lifecycle, &breakers, self.boot_degraded);

        HealthReport {
            state: self.state(),
            nodes: self.statuses.clone(),
            breakers,
            metrics: self.telemetry.snapshot(),
            unresolved_workflows: self.orchestrator.unresolved(),
        }
    }

    /// Stop accepting work, drain the scheduler and release handlers
    pub async fn shutdown(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Stopped | LifecycleState::Stopping => return Ok(()),
            _ => self.lifecycle.transition(LifecycleState::Stopping)?,
        }
        self.health_watch.cancel();
        self.scheduler.shutdown().await;
        self.registry.shutdown_all().await;
        if let Err(e) = self.source.lock().await.close().await {
            tracing::warn!(error = %e, "event source close failed");
        }
        self.lifecycle.transition(LifecycleState::Stopped)
    }

    fn ensure_serving(&self) -> Result<()> {
        let state = self.state();
        if state.is_serving() {
            Ok(())
        } else {
            Err(HostError::InvalidLifecycle {
                from: state.to_string(),
                to: "dispatch".to_string(),
            })
        }
    }
}

/// Move between RUNNING and DEGRADED as breakers open and close
fn refresh_health(lifecycle: &Lifecycle, breakers: &BTreeMap<String, BreakerMetrics>, boot_degraded: bool) {
    let any_open = breakers.values().any(|m| m.state == Some(CircuitState::Open));
    let target = match lifecycle.get() {
        LifecycleState::Running if any_open => LifecycleState::Degraded,
        LifecycleState::Degraded if !any_open && !boot_degraded => LifecycleState::Running,
        _ => return,
    };
    if let Err(e) = lifecycle.transition(target) {
        tracing::debug!(error = %e, "health state change raced");
    }
}

/// Re-evaluate host health on every breaker transition until cancelled
async fn watch_breakers(
    lifecycle: Arc<Lifecycle>,
    registry: Arc<HandlerRegistry>,
    boot_degraded: bool,
    mut events: broadcast::Receiver<HostEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(HostEvent::BreakerTransition { handler_type, to, .. }) => {
                tracing::debug!(%handler_type, %to, "breaker transition observed");
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "breaker watcher lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
        refresh_health(&lifecycle, &registry.breaker_metrics(), boot_degraded);
    }
}
