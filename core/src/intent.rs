//! Intent types - side effects requested by stateful nodes
//!
//! Reducers and orchestrators never perform I/O on their own. They return
//! intents describing what should happen and the [`IntentRouter`] carries
//! them out.
//!
//! [`IntentRouter`]: crate::intent_router::IntentRouter

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of intent types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentType {
    StateUpdate,
    WorkflowTrigger,
    EventPublish,
    CacheWrite,
    DataFetch,
    Log,
    Metric,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateUpdate => "STATE_UPDATE",
            Self::WorkflowTrigger => "WORKFLOW_TRIGGER",
            Self::EventPublish => "EVENT_PUBLISH",
            Self::CacheWrite => "CACHE_WRITE",
            Self::DataFetch => "DATA_FETCH",
            Self::Log => "LOG",
            Self::Metric => "METRIC",
        }
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority inside one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A request to perform one side effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,

    #[serde(rename = "type")]
    pub intent_type: IntentType,

    /// Handler name for effect intents, node id for WORKFLOW_TRIGGER,
    /// observer name for LOG / METRIC
    pub target: String,

    pub payload: Value,

    pub correlation_id: Uuid,

    #[serde(default)]
    pub priority: Priority,

    /// Time-to-live in milliseconds, measured from `created_at`
    #[serde(default, rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,

    pub created_at: DateTime<Utc>,
}

impl Intent {
    pub fn new(
        intent_type: IntentType,
        target: impl Into<String>,
        payload: Value,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_type,
            target: target.into(),
            payload,
            correlation_id,
            priority: Priority::default(),
            ttl_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: Option<u64>) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Instant after which the intent must not run
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = i64::try_from(self.ttl_ms?).ok()?;
        self.created_at.checked_add_signed(ChronoDuration::milliseconds(ttl))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| deadline < now)
    }
}
