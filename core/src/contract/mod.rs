//! Node contracts
//!
//! A contract is the declarative description of one node: its identity,
//! kind, the handlers it needs, what it subscribes to and how it may be
//! scheduled. Contracts are validated once at load time and are immutable
//! afterwards; `NodeMetadata` adds the computed structural fingerprint.

pub mod lockfile;
pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{HostError, Result};
use crate::reducer::FsmType;

pub use store::{ContractStore, LoadOutcome};

/// Number of hex chars kept from the SHA-256 digest
pub const FINGERPRINT_HASH_LEN: usize = 12;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// The four node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Compute,
    Effect,
    Orchestrator,
    Reducer,
}

impl NodeKind {
    /// Required `node_id` suffix
    pub fn suffix(&self) -> &'static str {
        match self {
            NodeKind::Compute => "compute",
            NodeKind::Effect => "effect",
            NodeKind::Orchestrator => "orchestrator",
            NodeKind::Reducer => "reducer",
        }
    }

    pub fn may_emit_intents(&self) -> bool {
        matches!(self, NodeKind::Orchestrator | NodeKind::Reducer)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Compute => write!(f, "COMPUTE"),
            NodeKind::Effect => write!(f, "EFFECT"),
            NodeKind::Orchestrator => write!(f, "ORCHESTRATOR"),
            NodeKind::Reducer => write!(f, "REDUCER"),
        }
    }
}

/// What binding does when an optional handler is not registered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissing {
    SkipSilently,
    #[default]
    WarnAndSkip,
    Degrade,
    Error,
}

/// One declared handler dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerRequirement {
    pub handler_type: String,
    pub protocol: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub on_missing: OnMissing,
}

fn default_required() -> bool {
    true
}

impl HandlerRequirement {
    /// Missing handler aborts binding
    pub fn is_mandatory(&self) -> bool {
        self.required || self.on_missing == OnMissing::Error
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Subscription {
    pub topic: String,
    pub consumer_group: String,
}

/// Scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    Parallelizable,
    Sequential,
    StrictlySequential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceBudget {
    /// Budget for each handler call made by this node
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for PerformanceBudget {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// One step of an orchestrator workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowStep {
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Static input merged into the step payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// A declared multi-step workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    /// Run once, in reverse declaration order, when any step fails
    ///
    /// `depends_on` here names the forward steps a compensation undoes; it
    /// runs only if all of them completed.
    #[serde(default)]
    pub compensation: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkflowDefinition {
    /// Deterministic topological order of `steps`
    ///
    /// Kahn's algorithm; among ready steps the earliest declared runs first.
    pub fn execution_order(&self) -> std::result::Result<Vec<&WorkflowStep>, String> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let &d = index
                    .get(dep.as_str())
                    .ok_or_else(|| format!("step {} depends on unknown step {}", step.id, dep))?;
                dependents[d].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.steps.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(i) = ready.pop_first() {
            order.push(&self.steps[i]);
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.steps.len() {
            let cyclic: Vec<&str> = self
                .steps
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, s)| s.id.as_str())
                .collect();
            return Err(format!("cyclic step dependencies among [{}]", cyclic.join(", ")));
        }
        Ok(order)
    }

    fn validate(&self, owner: &str) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("workflow name must not be empty".to_string());
        }
        if self.steps.is_empty() {
            return Err(format!("workflow {} declares no steps", self.name));
        }
        let mut seen = HashSet::new();
        for step in self.steps.iter().chain(&self.compensation) {
            if !seen.insert(step.id.as_str()) {
                return Err(format!("workflow {}: duplicate step id {}", self.name, step.id));
            }
            if step.node_id == owner {
                return Err(format!("workflow {}: step {} targets its own orchestrator", self.name, step.id));
            }
            validate_node_id(&step.node_id)
                .map_err(|reason| format!("workflow {}: step {}: {}", self.name, step.id, reason))?;
        }
        for step in &self.compensation {
            if let Some(dep) = step.depends_on.iter().find(|d| !self.steps.iter().any(|s| &s.id == *d)) {
                return Err(format!(
                    "workflow {}: compensation step {} undoes unknown step {}",
                    self.name, step.id, dep
                ));
            }
        }
        self.execution_order()
            .map(|_| ())
            .map_err(|reason| format!("workflow {}: {}", self.name, reason))
    }
}

/// Contract document as written in YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Contract {
    pub node_id: String,
    pub version: String,
    pub kind: NodeKind,

    /// Free text; not part of the fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared fingerprint; must match the computed one when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    #[serde(default)]
    pub handlers: Vec<HandlerRequirement>,

    #[serde(default)]
    pub subscriptions: Vec<Subscription>,

    pub concurrency: ConcurrencyPolicy,

    #[serde(default)]
    pub profile_tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsm_type: Option<FsmType>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflows: Vec<WorkflowDefinition>,

    #[serde(default)]
    pub performance: PerformanceBudget,
}

/// Fields that define a contract's structure
#[derive(Serialize)]
struct StructuralView<'a> {
    node_id: &'a str,
    version: &'a str,
    kind: NodeKind,
    handlers: &'a [HandlerRequirement],
    subscriptions: &'a [Subscription],
    concurrency: ConcurrencyPolicy,
    profile_tags: &'a [String],
    fsm_type: Option<FsmType>,
    workflows: &'a [WorkflowDefinition],
    performance: &'a PerformanceBudget,
}

impl Contract {
    /// Parse a YAML document without validating it
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yml::from_str(text).map_err(|e| HostError::contract("<unparsed>", e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yml::to_string(self)?)
    }

    /// `<version>:<sha256_12>` over the canonical JSON of the structural fields
    ///
    /// Canonical means struct fields in declaration order and JSON objects
    /// with sorted keys, so the result does not depend on YAML key order.
    pub fn compute_fingerprint(&self) -> Result<String> {
        let view = StructuralView {
            node_id: &self.node_id,
            version: &self.version,
            kind: self.kind,
            handlers: &self.handlers,
            subscriptions: &self.subscriptions,
            concurrency: self.concurrency,
            profile_tags: &self.profile_tags,
            fsm_type: self.fsm_type,
            workflows: &self.workflows,
            performance: &self.performance,
        };
        let canonical = serde_json::to_vec(&view)?;
        let digest = hex::encode(Sha256::digest(&canonical));
        Ok(format!("{}:{}", self.version, &digest[..FINGERPRINT_HASH_LEN]))
    }

    /// Structural validation; does not look at other contracts
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(HostError::contract(&self.node_id, reason));

        if let Err(reason) = validate_node_id(&self.node_id) {
            return fail(reason);
        }
        if !self.node_id.ends_with(&format!("_{}", self.kind.suffix())) {
            return fail(format!(
                "node_id suffix must match kind {} (expected *_{})",
                self.kind,
                self.kind.suffix()
            ));
        }
        if let Err(e) = self.version.parse::<SemVer>() {
            return fail(e);
        }

        let mut handler_types = HashSet::new();
        for handler in &self.handlers {
            if handler.handler_type.trim().is_empty() || handler.protocol.trim().is_empty() {
                return fail("handler entries need handler_type and protocol".to_string());
            }
            if !handler_types.insert(handler.handler_type.as_str()) {
                return fail(format!("handler {} declared twice", handler.handler_type));
            }
        }
        for sub in &self.subscriptions {
            if sub.topic.trim().is_empty() || sub.consumer_group.trim().is_empty() {
                return fail("subscriptions need topic and consumer_group".to_string());
            }
        }
        if self.performance.timeout_ms == 0 {
            return fail("performance.timeout_ms must be non-zero".to_string());
        }

        match (self.kind, self.fsm_type) {
            (NodeKind::Reducer, None) => return fail("reducer contracts must declare fsm_type".to_string()),
            (NodeKind::Reducer, Some(_)) => {}
            (kind, Some(_)) => return fail(format!("fsm_type is only valid on reducers, not {}", kind)),
            (_, None) => {}
        }

        if self.kind == NodeKind::Orchestrator {
            if self.workflows.is_empty() {
                return fail("orchestrator contracts must declare at least one workflow".to_string());
            }
            let mut names = HashSet::new();
            for workflow in &self.workflows {
                if !names.insert(workflow.name.as_str()) {
                    return fail(format!("workflow {} declared twice", workflow.name));
                }
                if let Err(reason) = workflow.validate(&self.node_id) {
                    return fail(reason);
                }
            }
        } else if !self.workflows.is_empty() {
            return fail(format!("workflows are only valid on orchestrators, not {}", self.kind));
        }

        if let Some(declared) = &self.fingerprint {
            let computed = self.compute_fingerprint()?;
            if declared != &computed {
                return fail(format!(
                    "declared fingerprint {} does not match computed {}",
                    declared, computed
                ));
            }
        }
        Ok(())
    }
}

/// `<name>_<kind>`: lowercase ascii segments joined by `_`
fn validate_node_id(node_id: &str) -> std::result::Result<(), String> {
    let Some((name, suffix)) = node_id.rsplit_once('_') else {
        return Err(format!("node_id '{}' must have the form <name>_<kind>", node_id));
    };
    let valid_chars = node_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    let starts_with_letter = node_id.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    if !valid_chars || !starts_with_letter || name.is_empty() || name.ends_with('_') || node_id.contains("__") {
        return Err(format!("node_id '{}' must be lowercase snake_case", node_id));
    }
    if !["compute", "effect", "orchestrator", "reducer"].contains(&suffix) {
        return Err(format!("node_id '{}' must end with a node kind", node_id));
    }
    Ok(())
}

/// Semantic version `MAJOR.MINOR.PATCH[-pre][+build]`
///
/// Build metadata is dropped on parse and never affects precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl FromStr for SemVer {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || format!("'{}' is not a valid semantic version", s);
        let core_and_pre = s.split_once('+').map_or(s, |(head, build)| {
            if build.is_empty() {
                ""
            } else {
                head
            }
        });
        let (core, pre) = match core_and_pre.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (core_and_pre, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            let leading_zero = part.len() > 1 && part.starts_with('0');
            if part.is_empty() || leading_zero || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(SemVer {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            pre,
        })
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                // A pre-release sorts before its release
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_pre(a, b),
            })
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Dot-separated identifiers: numeric ones compare as numbers and sort
/// below alphanumeric ones; a shorter prefix sorts first
fn compare_pre(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        let ordering = match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match (x.parse::<u64>(), y.parse::<u64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => x.cmp(y),
            },
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

/// A validated contract plus its computed fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetadata {
    contract: Contract,
    fingerprint: String,
}

impl NodeMetadata {
    /// Validate and fingerprint a contract
    pub fn from_contract(contract: Contract) -> Result<Self> {
        contract.validate()?;
        let fingerprint = contract.compute_fingerprint()?;
        Ok(Self {
            contract,
            fingerprint,
        })
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn node_id(&self) -> &str {
        &self.contract.node_id
    }

    pub fn version(&self) -> &str {
        &self.contract.version
    }

    /// Parsed version; validated at construction
    pub fn semver(&self) -> Result<SemVer> {
        self.contract
            .version
            .parse()
            .map_err(|reason: String| HostError::contract(self.node_id(), reason))
    }

    pub fn kind(&self) -> NodeKind {
        self.contract.kind
    }

    pub fn concurrency(&self) -> ConcurrencyPolicy {
        self.contract.concurrency
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn handlers(&self) -> &[HandlerRequirement] {
        &self.contract.handlers
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.contract.subscriptions
    }

    pub fn profile_tags(&self) -> &[String] {
        &self.contract.profile_tags
    }

    pub fn fsm_type(&self) -> Option<FsmType> {
        self.contract.fsm_type
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.contract.workflows.iter().find(|w| w.name == name)
    }

    pub fn workflows(&self) -> &[WorkflowDefinition] {
        &self.contract.workflows
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.contract.performance.timeout_ms)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Contract documents shared by tests across the crate

    pub const PARSER_COMPUTE: &str = r#"
node_id: document_parser_compute
version: 1.0.0
kind: COMPUTE
description: Splits raw documents into sections
concurrency: parallelizable
profile_tags: [ingest]
"#;

    pub const INGESTION_REDUCER: &str = r#"
node_id: ingestion_reducer
version: 1.2.0
kind: REDUCER
fsm_type: INGESTION
concurrency: sequential
handlers:
  - handler_type: state_store
    protocol: StateStoreProtocol
    required: true
subscriptions:
  - topic: ingestion.events
    consumer_group: ingestion
profile_tags: [ingest]
"#;

    pub const VECTOR_INDEX_EFFECT: &str = r#"
node_id: vector_index_effect
version: 0.3.1
kind: EFFECT
concurrency: parallelizable
handlers:
  - handler_type: vector_store
    protocol: VectorStoreProtocol
    required: true
  - handler_type: cache
    protocol: CacheProtocol
    required: false
    on_missing: warn_and_skip
performance:
  timeout_ms: 2000
"#;

    pub const INGESTION_ORCHESTRATOR: &str = r#"
node_id: ingestion_orchestrator
version: 2.0.0
kind: ORCHESTRATOR
concurrency: parallelizable
workflows:
  - name: ingest_document
    timeout_ms: 60000
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
}
