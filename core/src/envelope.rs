//! Message envelope
//!
//! The envelope is the only thing that flows from an event source into the
//! router. It wraps one payload with correlation and trace metadata. Node
//! code never sees the envelope itself; it receives a [`NodeInput`] view
//! that leaves out the transport identity (`source_topic`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{HostError, Result};

/// Frozen envelope schema version. Recorded in the protocol lockfile.
pub const ENVELOPE_SCHEMA_VERSION: &str = "1.0.0";

/// Transport wrapper around one payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_version: String,

    /// Unique per delivery attempt chain; the dedup key for host retries
    pub envelope_id: Uuid,

    /// Shared by every envelope and intent that belongs to one logical request
    pub correlation_id: Uuid,

    /// Envelope that caused this one, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,

    /// Target node
    pub node_id: String,

    pub timestamp: DateTime<Utc>,

    pub payload: Value,

    #[serde(default)]
    pub context: EnvelopeContext,
}

/// Trace metadata carried alongside the payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeContext {
    #[serde(default)]
    pub trace_id: String,

    #[serde(default)]
    pub span_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

impl EnvelopeContext {
    fn fresh() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: Uuid::new_v4().simple().to_string(),
            source_topic: None,
            profile: None,
        }
    }
}

impl Envelope {
    /// Create a root envelope with fresh ids
    pub fn new(node_id: impl Into<String>, payload: Value) -> Self {
        let envelope_id = Uuid::new_v4();
        Self {
            envelope_version: ENVELOPE_SCHEMA_VERSION.to_string(),
            envelope_id,
            correlation_id: envelope_id,
            causation_id: None,
            node_id: node_id.into(),
            timestamp: Utc::now(),
            payload,
            context: EnvelopeContext::fresh(),
        }
    }

    pub fn with_id(mut self, envelope_id: Uuid) -> Self {
        self.envelope_id = envelope_id;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_source_topic(mut self, topic: impl Into<String>) -> Self {
        self.context.source_topic = Some(topic.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.context.profile = Some(profile.into());
        self
    }

    /// Reject envelopes written against a different major schema version
    pub fn check_version(&self) -> Result<()> {
        let major = |v: &str| v.split('.').next().map(str::to_owned);
        if major(&self.envelope_version) != major(ENVELOPE_SCHEMA_VERSION) {
            return Err(HostError::EnvelopeVersion {
                found: self.envelope_version.clone(),
                expected: ENVELOPE_SCHEMA_VERSION.to_string(),
            });
        }
        Ok(())
    }

    /// The view handed to node code
    pub fn to_node_input(&self) -> NodeInput {
        NodeInput {
            envelope_id: self.envelope_id,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            node_id: self.node_id.clone(),
            timestamp: self.timestamp,
            payload: self.payload.clone(),
            trace_id: self.context.trace_id.clone(),
            span_id: self.context.span_id.clone(),
            profile: self.context.profile.clone(),
        }
    }
}

/// Read-only envelope view for node code
///
/// Carries no `source_topic`: a node must behave the same no matter which
/// subscription delivered its input.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInput {
    pub envelope_id: Uuid,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub trace_id: String,
    pub span_id: String,
    pub profile: Option<String>,
}

impl NodeInput {
    /// Build an envelope caused by this input
    ///
    /// Keeps correlation, trace and timestamp so that derived envelopes are
    /// a function of their parent. `envelope_id` is supplied by the caller.
    pub fn child_envelope(&self, envelope_id: Uuid, node_id: impl Into<String>, payload: Value) -> Envelope {
        Envelope {
            envelope_version: ENVELOPE_SCHEMA_VERSION.to_string(),
            envelope_id,
            correlation_id: self.correlation_id,
            causation_id: Some(self.envelope_id),
            node_id: node_id.into(),
            timestamp: self.timestamp,
            payload,
            context: EnvelopeContext {
                trace_id: self.trace_id.clone(),
                span_id: envelope_id.simple().to_string(),
                source_topic: None,
                profile: self.profile.clone(),
            },
        }
    }
}
