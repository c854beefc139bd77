//! Unified FSM reducer engine
//!
//! `evaluate(fsm_type, entity_id, current_state, event, metadata)` maps to
//! `(new_state, intents)`. The engine performs no I/O and reads no clock:
//! intent ids are UUIDv5 over the inputs and timestamps come from
//! `metadata`, so equal inputs always produce equal outputs.

pub mod definitions;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{HostError, Result};
use crate::ids;
use crate::intent::{Intent, IntentType, Priority};

/// Catch-all source state
pub const WILDCARD_STATE: &str = "*";

/// FSM type tag; unknown tags are rejected when parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmType {
    Ingestion,
    QualityAssessment,
    PatternLearning,
}

impl FsmType {
    pub const ALL: [FsmType; 3] = [FsmType::Ingestion, FsmType::QualityAssessment, FsmType::PatternLearning];

    pub fn as_str(&self) -> &'static str {
        match self {
            FsmType::Ingestion => "INGESTION",
            FsmType::QualityAssessment => "QUALITY_ASSESSMENT",
            FsmType::PatternLearning => "PATTERN_LEARNING",
        }
    }
}

impl fmt::Display for FsmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsmType {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        FsmType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| HostError::UnknownFsmType(s.to_string()))
    }
}

/// Intent emitted by a transition, before it is bound to an entity
#[derive(Debug, Clone, PartialEq)]
pub struct IntentTemplate {
    pub intent_type: IntentType,
    pub target: String,
    pub priority: Priority,
    pub ttl_ms: Option<u64>,
}

impl IntentTemplate {
    pub fn new(intent_type: IntentType, target: impl Into<String>) -> Self {
        Self {
            intent_type,
            target: target.into(),
            priority: Priority::Normal,
            ttl_ms: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub intents_emitted: Vec<IntentTemplate>,
}

/// Validated transition table for one FSM type
#[derive(Debug, Clone)]
pub struct FsmDefinition {
    fsm_type: FsmType,
    states: BTreeSet<String>,
    initial: String,
    terminal: BTreeSet<String>,
    transitions: Vec<Transition>,
    index: HashMap<(String, String), usize>,
}

impl FsmDefinition {
    pub fn builder(fsm_type: FsmType) -> FsmDefinitionBuilder {
        FsmDefinitionBuilder {
            fsm_type,
            states: Vec::new(),
            initial: Vec::new(),
            terminal: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn fsm_type(&self) -> FsmType {
        self.fsm_type
    }

    pub fn initial_state(&self) -> &str {
        &self.initial
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal.contains(state)
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(String::as_str)
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Exact match first, then the wildcard row
    fn lookup(&self, state: &str, event: &str) -> Option<&Transition> {
        self.index
            .get(&(state.to_string(), event.to_string()))
            .or_else(|| self.index.get(&(WILDCARD_STATE.to_string(), event.to_string())))
            .map(|&i| &self.transitions[i])
    }
}

pub struct FsmDefinitionBuilder {
    fsm_type: FsmType,
    states: Vec<String>,
    initial: Vec<String>,
    terminal: Vec<String>,
    transitions: Vec<Transition>,
}

impl FsmDefinitionBuilder {
    pub fn state(mut self, name: &str) -> Self {
        self.states.push(name.to_string());
        self
    }

    pub fn initial(mut self, name: &str) -> Self {
        self.initial.push(name.to_string());
        self.state(name)
    }

    pub fn terminal(mut self, name: &str) -> Self {
        self.terminal.push(name.to_string());
        self.state(name)
    }

    pub fn transition(mut self, from: &str, event: &str, to: &str, intents: Vec<IntentTemplate>) -> Self {
        self.transitions.push(Transition {
            from_state: from.to_string(),
            to_state: to.to_string(),
            event: event.to_string(),
            intents_emitted: intents,
        });
        self
    }

    pub fn build(self) -> Result<FsmDefinition> {
        let fail = |reason: String| {
            Err(HostError::InvalidFsmDefinition {
                fsm_type: self.fsm_type.to_string(),
                reason,
            })
        };

        let states: BTreeSet<String> = self.states.iter().cloned().collect();
        if states.len() != self.states.len() {
            return fail("state declared twice".to_string());
        }
        if states.contains(WILDCARD_STATE) {
            return fail("'*' is reserved for wildcard transitions".to_string());
        }
        let initial = match self.initial.as_slice() {
            [only] => only.clone(),
            [] => return fail("no initial state".to_string()),
            _ => return fail(format!("{} initial states; exactly one allowed", self.initial.len())),
        };
        if self.terminal.is_empty() {
            return fail("at least one terminal state required".to_string());
        }
        let terminal: BTreeSet<String> = self.terminal.iter().cloned().collect();
        if terminal.contains(&initial) {
            return fail(format!("initial state {} cannot be terminal", initial));
        }

        let mut index = HashMap::new();
        for (i, t) in self.transitions.iter().enumerate() {
            if t.from_state != WILDCARD_STATE && !states.contains(&t.from_state) {
                return fail(format!("transition from unknown state {}", t.from_state));
            }
            if !states.contains(&t.to_state) {
                return fail(format!("transition to unknown state {}", t.to_state));
            }
            if terminal.contains(&t.from_state) {
                return fail(format!("terminal state {} has an outgoing transition", t.from_state));
            }
            if index.insert((t.from_state.clone(), t.event.clone()), i).is_some() {
                return fail(format!("duplicate transition {} on {}", t.from_state, t.event));
            }
        }

        Ok(FsmDefinition {
            fsm_type: self.fsm_type,
            states,
            initial,
            terminal,
            transitions: self.transitions,
            index,
        })
    }
}

/// Context for one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMetadata {
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    /// Event data carried into emitted payloads
    pub data: Value,
}

impl TransitionMetadata {
    pub fn new(correlation_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            causation_id: None,
            timestamp,
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Outcome of a successful evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub previous_state: String,
    pub new_state: String,
    pub intents: Vec<Intent>,
}

/// Multiplexed reducer over all registered FSM types
#[derive(Debug, Clone)]
pub struct ReducerEngine {
    definitions: BTreeMap<FsmType, FsmDefinition>,
}

impl ReducerEngine {
    /// Engine with the built-in FSM tables
    pub fn with_builtin() -> Result<Self> {
        Self::with_definitions(definitions::builtin()?)
    }

    pub fn with_definitions(defs: Vec<FsmDefinition>) -> Result<Self> {
        let mut definitions = BTreeMap::new();
        for def in defs {
            let fsm_type = def.fsm_type;
            if definitions.insert(fsm_type, def).is_some() {
                return Err(HostError::InvalidFsmDefinition {
                    fsm_type: fsm_type.to_string(),
                    reason: "registered twice".to_string(),
                });
            }
        }
        Ok(Self { definitions })
    }

    pub fn definition(&self, fsm_type: FsmType) -> Result<&FsmDefinition> {
        self.definitions
            .get(&fsm_type)
            .ok_or_else(|| HostError::UnknownFsmType(fsm_type.to_string()))
    }

    pub fn initial_state(&self, fsm_type: FsmType) -> Result<&str> {
        Ok(self.definition(fsm_type)?.initial_state())
    }

    pub fn evaluate(
        &self,
        fsm_type: FsmType,
        entity_id: &str,
        current_state: &str,
        event: &str,
        metadata: &TransitionMetadata,
    ) -> Result<Reduction> {
        let def = self.definition(fsm_type)?;
        let reject = |reason: &str| HostError::FsmTransition {
            fsm_type: fsm_type.to_string(),
            entity_id: entity_id.to_string(),
            current_state: current_state.to_string(),
            event: event.to_string(),
            reason: reason.to_string(),
        };

        if def.is_terminal(current_state) {
            return Err(reject("terminal state"));
        }
        if !def.states.contains(current_state) {
            return Err(reject("unknown state"));
        }
        let transition = def
            .lookup(current_state, event)
            .ok_or_else(|| reject("no matching transition"))?;

        let intents = transition
            .intents_emitted
            .iter()
            .enumerate()
            .map(|(i, template)| {
                let id = ids::derive(&[
                    &metadata.correlation_id.to_string(),
                    fsm_type.as_str(),
                    entity_id,
                    current_state,
                    event,
                    &i.to_string(),
                ]);
                let payload = intent_payload(template.intent_type, fsm_type, entity_id, current_state, &transition.to_state, event, metadata);
                Intent::new(template.intent_type, &template.target, payload, metadata.correlation_id)
                    .with_id(id)
                    .with_priority(template.priority)
                    .with_ttl_ms(template.ttl_ms)
                    .with_created_at(metadata.timestamp)
            })
            .collect();

        Ok(Reduction {
            previous_state: current_state.to_string(),
            new_state: transition.to_state.clone(),
            intents,
        })
    }
}

/// Payload shape per intent type
fn intent_payload(
    intent_type: IntentType,
    fsm_type: FsmType,
    entity_id: &str,
    previous_state: &str,
    new_state: &str,
    event: &str,
    metadata: &TransitionMetadata,
) -> Value {
    let timestamp = metadata.timestamp.to_rfc3339();
    match intent_type {
        IntentType::StateUpdate => json!({
            "entity_id": entity_id,
            "fsm_type": fsm_type,
            "previous_state": previous_state,
            "new_state": new_state,
            "timestamp": timestamp,
        }),
        IntentType::WorkflowTrigger => json!({
            "entity_id": entity_id,
            "fsm_type": fsm_type,
            "trigger_state": new_state,
            "event": event,
            "data": metadata.data,
        }),
        IntentType::EventPublish => json!({
            "topic": format!("{}.{}", fsm_type.as_str().to_lowercase(), new_state.to_lowercase()),
            "entity_id": entity_id,
            "fsm_type": fsm_type,
            "event": event,
            "previous_state": previous_state,
            "new_state": new_state,
            "timestamp": timestamp,
        }),
        IntentType::CacheWrite => json!({
            "key": format!("{}:{}", fsm_type, entity_id),
            "value": {
                "state": new_state,
                "data": metadata.data,
                "timestamp": timestamp,
            },
        }),
        IntentType::DataFetch => json!({
            "id": entity_id,
            "entity_id": entity_id,
            "fsm_type": fsm_type,
            "state": new_state,
        }),
        IntentType::Log => json!({
            "level": if new_state == "FAILED" { "error" } else { "info" },
            "message": format!("{} {} {} -> {} on {}", fsm_type, entity_id, previous_state, new_state, event),
            "data": metadata.data,
        }),
        IntentType::Metric => json!({
            "name": format!("{}.{}", fsm_type.as_str().to_lowercase(), new_state.to_lowercase()),
            "value": 1.0,
        }),
    }
}
