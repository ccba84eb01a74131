//! Envelope: the immutable wire unit for inter-agent messages.
//!
//! Every message that crosses the fabric is wrapped in an [`Envelope`]
//! carrying a globally unique id, the sender and recipient agent ids, a
//! message type tag, a wall-clock timestamp, and an opaque JSON payload.
//! Envelopes are constructed through an [`EnvelopeFactory`] bound to a
//! fixed sender, then handed to the router; the factory never validates,
//! the router does.
//!
//! # Wire format (schema version 1)
//!
//! ```json
//! {
//!   "id": "5b1c…",
//!   "schemaVersion": 1,
//!   "sender": "sun",
//!   "recipient": "mars",
//!   "correlationId": "a811…",
//!   "type": "task-proposal",
//!   "timestamp": 1754000000000,
//!   "payload": { "task": "survey crater" },
//!   "metadata": { "tier": "L0" }
//! }
//! ```
//!
//! Decoding rejects any `schemaVersion` other than the one this build
//! understands before interpreting a single field.

use crate::orrery::tier::Tier;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use uuid::Uuid;

/// The envelope schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

/// Wildcard recipient addressing every other registered agent.
pub const BROADCAST_RECIPIENT: &str = "*";

/// Message type tag carried on every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeType {
    Request,
    Response,
    Notification,
    TaskProposal,
    TaskAccept,
    TaskReject,
    StreamStart,
    StreamData,
    StreamEnd,
    Heartbeat,
    Error,
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            EnvelopeType::Request => "request",
            EnvelopeType::Response => "response",
            EnvelopeType::Notification => "notification",
            EnvelopeType::TaskProposal => "task-proposal",
            EnvelopeType::TaskAccept => "task-accept",
            EnvelopeType::TaskReject => "task-reject",
            EnvelopeType::StreamStart => "stream-start",
            EnvelopeType::StreamData => "stream-data",
            EnvelopeType::StreamEnd => "stream-end",
            EnvelopeType::Heartbeat => "heartbeat",
            EnvelopeType::Error => "error",
        };
        write!(f, "{}", tag)
    }
}

/// Optional routing metadata attached by the factory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    /// Sender tier at construction time. Informational; the router
    /// re-derives tiers from the registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    /// Sandbox the sender lives in, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    /// Routing hint. `"capability"` tells the router to read `recipient`
    /// as a capability name rather than an agent id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_hint: Option<String>,
    /// Escalation justification, required when a lower tier addresses a
    /// higher one under the default policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<String>,
}

impl EnvelopeMetadata {
    fn is_empty(&self) -> bool {
        self.tier.is_none()
            && self.sandbox_id.is_none()
            && self.routing_hint.is_none()
            && self.escalation.is_none()
    }
}

/// The immutable wire unit. See the module docs for the JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub schema_version: u32,
    pub sender: String,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: EnvelopeType,
    /// Wall-clock milliseconds at construction.
    pub timestamp: i64,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
}

impl Envelope {
    /// Whether this envelope addresses every other registered agent.
    pub fn is_broadcast(&self) -> bool {
        self.recipient == BROADCAST_RECIPIENT
    }

    /// Routing hint from the metadata, if any.
    pub fn routing_hint(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.routing_hint.as_deref())
    }

    /// Escalation justification from the metadata, if any.
    pub fn escalation(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.escalation.as_deref())
    }

    /// Serialize to the schema-version-1 JSON form.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Parse the JSON form, rejecting unknown schema versions before any
    /// field interpretation.
    pub fn from_json(raw: &str) -> Result<Envelope, EnvelopeError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        match value.get("schemaVersion").and_then(|v| v.as_u64()) {
            Some(found) if found == SCHEMA_VERSION as u64 => {}
            Some(found) => return Err(EnvelopeError::VersionMismatch { found }),
            None => {
                return Err(EnvelopeError::Malformed(
                    "missing schemaVersion field".to_string(),
                ))
            }
        }
        serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, Clone)]
pub enum EnvelopeError {
    /// The decoder met a `schemaVersion` this build does not understand.
    VersionMismatch { found: u64 },
    /// The bytes were not a structurally valid envelope.
    Malformed(String),
}

impl EnvelopeError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        "schema-mismatch"
    }
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::VersionMismatch { found } => write!(
                f,
                "Envelope schema version mismatch: found {}, expected {}",
                found, SCHEMA_VERSION
            ),
            EnvelopeError::Malformed(msg) => write!(f, "Malformed envelope: {}", msg),
        }
    }
}

impl Error for EnvelopeError {}

/// Per-envelope construction options.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Reuse an existing correlation id to continue a thread.
    pub correlation_id: Option<String>,
    /// Routing hint, e.g. `"capability"`.
    pub routing_hint: Option<String>,
    /// Escalation justification for tier-gated sends.
    pub escalation: Option<String>,
}

/// Constructs envelopes bound to a fixed sender.
///
/// The factory stamps every envelope with a fresh uuid, the current
/// wall-clock milliseconds, and the sender's tier and sandbox metadata
/// when those are configured.
///
/// ```rust
/// use orrery::envelope::{EnvelopeFactory, EnvelopeType};
/// use orrery::tier::Tier;
///
/// let factory = EnvelopeFactory::new("sun").with_tier(Tier::L0);
/// let env = factory.create_request("mars", serde_json::json!({"op": "status"}));
/// assert_eq!(env.sender, "sun");
/// assert_eq!(env.message_type, EnvelopeType::Request);
/// ```
#[derive(Debug, Clone)]
pub struct EnvelopeFactory {
    sender: String,
    tier: Option<Tier>,
    sandbox_id: Option<String>,
}

impl EnvelopeFactory {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            tier: None,
            sandbox_id: None,
        }
    }

    /// Stamp outgoing envelopes with the sender's tier.
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Stamp outgoing envelopes with the sender's sandbox id.
    pub fn with_sandbox(mut self, sandbox_id: impl Into<String>) -> Self {
        self.sandbox_id = Some(sandbox_id.into());
        self
    }

    /// The agent id this factory signs envelopes as.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Construct an envelope of the given type. Fresh id, current
    /// wall-clock timestamp, metadata attached when anything is set.
    pub fn create_envelope(
        &self,
        message_type: EnvelopeType,
        recipient: impl Into<String>,
        payload: serde_json::Value,
        opts: CreateOptions,
    ) -> Envelope {
        let metadata = EnvelopeMetadata {
            tier: self.tier,
            sandbox_id: self.sandbox_id.clone(),
            routing_hint: opts.routing_hint,
            escalation: opts.escalation,
        };
        Envelope {
            id: Uuid::new_v4().to_string(),
            schema_version: SCHEMA_VERSION,
            sender: self.sender.clone(),
            recipient: recipient.into(),
            correlation_id: opts.correlation_id,
            message_type,
            timestamp: Utc::now().timestamp_millis(),
            payload,
            metadata: if metadata.is_empty() {
                None
            } else {
                Some(metadata)
            },
        }
    }

    /// A `request` envelope with a fresh correlation id.
    pub fn create_request(
        &self,
        recipient: impl Into<String>,
        payload: serde_json::Value,
    ) -> Envelope {
        self.create_envelope(
            EnvelopeType::Request,
            recipient,
            payload,
            CreateOptions {
                correlation_id: Some(Uuid::new_v4().to_string()),
                ..Default::default()
            },
        )
    }

    /// A `response` envelope continuing the given correlation thread.
    pub fn create_response(
        &self,
        recipient: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: impl Into<String>,
    ) -> Envelope {
        self.create_envelope(
            EnvelopeType::Response,
            recipient,
            payload,
            CreateOptions {
                correlation_id: Some(correlation_id.into()),
                ..Default::default()
            },
        )
    }

    /// A `notification` envelope broadcast to every other agent.
    pub fn create_notification(&self, payload: serde_json::Value) -> Envelope {
        self.create_envelope(
            EnvelopeType::Notification,
            BROADCAST_RECIPIENT,
            payload,
            CreateOptions::default(),
        )
    }

    /// A `task-proposal` envelope. Generates a fresh correlation id
    /// unless one is supplied.
    pub fn create_task_proposal(
        &self,
        recipient: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: Option<String>,
    ) -> Envelope {
        self.create_envelope(
            EnvelopeType::TaskProposal,
            recipient,
            payload,
            CreateOptions {
                correlation_id: Some(
                    correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                ),
                ..Default::default()
            },
        )
    }

    /// A `heartbeat` envelope with an empty payload.
    pub fn create_heartbeat(&self, recipient: impl Into<String>) -> Envelope {
        self.create_envelope(
            EnvelopeType::Heartbeat,
            recipient,
            serde_json::json!({}),
            CreateOptions::default(),
        )
    }

    /// An `error` envelope carrying a machine-readable kind and a human
    /// message, continuing the failed request's thread when given.
    pub fn create_error(
        &self,
        recipient: impl Into<String>,
        kind: &str,
        message: &str,
        correlation_id: Option<String>,
    ) -> Envelope {
        self.create_envelope(
            EnvelopeType::Error,
            recipient,
            serde_json::json!({ "kind": kind, "message": message }),
            CreateOptions {
                correlation_id,
                ..Default::default()
            },
        )
    }
}
