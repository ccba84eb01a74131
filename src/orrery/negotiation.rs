//! Task negotiation: proposal lifecycle, deadlines, and correlation
//! threads.
//!
//! A proposer calls [`TaskNegotiator::propose`], which sends a
//! `task-proposal` envelope through the router and records the proposal
//! as pending with a single scheduled deadline. The target's negotiator
//! ingests the envelope via
//! [`handle_incoming_proposal`](TaskNegotiator::handle_incoming_proposal)
//! and later calls [`accept`](TaskNegotiator::accept) or
//! [`reject`](TaskNegotiator::reject), both of which answer on the
//! originating correlation id.
//!
//! The proposal id keys the record; the correlation id threads the
//! envelopes. They are distinct identifiers.
//!
//! Terminal states (accepted, rejected, timed-out) are absorbing: the
//! deadline callback is a no-op if the record has already moved, and
//! accept/reject from a non-pending state fail with a state violation.

use crate::orrery::envelope::{CreateOptions, Envelope, EnvelopeFactory, EnvelopeType};
use crate::orrery::observability::{FabricEvent, ObservabilitySink};
use crate::orrery::router::Router;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Coarse size estimate attached to a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskComplexity {
    Simple,
    Medium,
    Complex,
}

/// The outbound description of a task being proposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProposal {
    pub task: String,
    pub required_capabilities: Vec<String>,
    pub complexity: TaskComplexity,
}

impl TaskProposal {
    pub fn new(task: impl Into<String>, complexity: TaskComplexity) -> Self {
        Self {
            task: task.into(),
            required_capabilities: Vec::new(),
            complexity,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }
}

/// Proposal lifecycle state. The last three are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    TimedOut,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalStatus::Pending => write!(f, "pending"),
            ProposalStatus::Accepted => write!(f, "accepted"),
            ProposalStatus::Rejected => write!(f, "rejected"),
            ProposalStatus::TimedOut => write!(f, "timed-out"),
        }
    }
}

/// A negotiation record owned by the negotiator that created it. Other
/// agents only ever see the envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationRecord {
    pub proposal_id: String,
    pub correlation_id: String,
    pub proposer: String,
    pub target: String,
    pub task: String,
    pub required_capabilities: Vec<String>,
    pub complexity: TaskComplexity,
    pub deadline_ms: u64,
    pub status: ProposalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative_suggestion: Option<String>,
}

/// Errors raised by negotiation operations.
#[derive(Debug, Clone)]
pub enum NegotiationError {
    NotFound(String),
    /// Accept/reject on a record that already left `pending`.
    InvalidState {
        proposal_id: String,
        status: ProposalStatus,
    },
    /// An incoming proposal envelope failed structural validation.
    SchemaMismatch(String),
}

impl NegotiationError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationError::NotFound(_) => "not-found",
            NegotiationError::InvalidState { .. } => "state-violation",
            NegotiationError::SchemaMismatch(_) => "schema-mismatch",
        }
    }
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::NotFound(id) => write!(f, "Proposal not found: {}", id),
            NegotiationError::InvalidState {
                proposal_id,
                status,
            } => write!(f, "Proposal {} is already {}", proposal_id, status),
            NegotiationError::SchemaMismatch(msg) => {
                write!(f, "Malformed proposal envelope: {}", msg)
            }
        }
    }
}

impl Error for NegotiationError {}

/// Listener for proposal arrivals and timeouts.
pub type ProposalListener = Arc<dyn Fn(&NegotiationRecord) + Send + Sync>;

/// Wire payload of a `task-proposal` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProposalPayload {
    proposal_id: String,
    task: String,
    required_capabilities: Vec<String>,
    complexity: TaskComplexity,
    deadline_ms: u64,
}

#[derive(Default)]
struct NegotiationState {
    records: HashMap<String, NegotiationRecord>,
    /// Proposal ids in creation order, for deterministic thread queries.
    order: Vec<String>,
}

impl NegotiationState {
    fn insert(&mut self, record: NegotiationRecord) {
        self.order.push(record.proposal_id.clone());
        self.records.insert(record.proposal_id.clone(), record);
    }
}

/// Owns proposal records keyed by proposal id and drives their
/// lifecycle.
pub struct TaskNegotiator {
    factory: EnvelopeFactory,
    router: Arc<Router>,
    sink: Arc<ObservabilitySink>,
    state: Arc<RwLock<NegotiationState>>,
    proposal_listeners: Arc<RwLock<Vec<ProposalListener>>>,
    timeout_listeners: Arc<RwLock<Vec<ProposalListener>>>,
}

impl TaskNegotiator {
    pub fn new(
        factory: EnvelopeFactory,
        router: Arc<Router>,
        sink: Arc<ObservabilitySink>,
    ) -> Self {
        Self {
            factory,
            router,
            sink,
            state: Arc::new(RwLock::new(NegotiationState::default())),
            proposal_listeners: Arc::new(RwLock::new(Vec::new())),
            timeout_listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// The agent id this negotiator proposes and answers as.
    pub fn agent_id(&self) -> &str {
        self.factory.sender()
    }

    /// Send a `task-proposal` to `target`, record it as pending, and
    /// schedule its deadline. Expiry without resolution moves the record
    /// to `timed-out` and notifies the timeout listeners; the callback is
    /// a no-op if the record already reached a terminal state.
    pub async fn propose(
        &self,
        target: &str,
        proposal: TaskProposal,
        deadline_ms: u64,
    ) -> Result<NegotiationRecord, NegotiationError> {
        let proposal_id = uuid::Uuid::new_v4().to_string();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let payload = ProposalPayload {
            proposal_id: proposal_id.clone(),
            task: proposal.task.clone(),
            required_capabilities: proposal.required_capabilities.clone(),
            complexity: proposal.complexity,
            deadline_ms,
        };
        let payload = serde_json::to_value(&payload)
            .map_err(|e| NegotiationError::SchemaMismatch(e.to_string()))?;
        let envelope =
            self.factory
                .create_task_proposal(target, payload, Some(correlation_id.clone()));

        let record = NegotiationRecord {
            proposal_id: proposal_id.clone(),
            correlation_id,
            proposer: self.factory.sender().to_string(),
            target: target.to_string(),
            task: proposal.task,
            required_capabilities: proposal.required_capabilities,
            complexity: proposal.complexity,
            deadline_ms,
            status: ProposalStatus::Pending,
            accepted_by: None,
            estimated_completion_ms: None,
            rejection_reason: None,
            alternative_suggestion: None,
        };
        self.state.write().await.insert(record.clone());

        let routing = self.router.send(envelope).await;
        if !routing.delivered {
            log::warn!(
                "negotiator: proposal {} to {} not delivered ({:?})",
                proposal_id,
                target,
                routing.error.map(|e| e.kind())
            );
        }

        self.schedule_timeout(proposal_id, deadline_ms);
        Ok(record)
    }

    fn schedule_timeout(&self, proposal_id: String, deadline_ms: u64) {
        let state = self.state.clone();
        let sink = self.sink.clone();
        let timeout_listeners = self.timeout_listeners.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(deadline_ms)).await;
            let expired = {
                let mut state = state.write().await;
                match state.records.get_mut(&proposal_id) {
                    Some(record) if record.status == ProposalStatus::Pending => {
                        record.status = ProposalStatus::TimedOut;
                        Some(record.clone())
                    }
                    _ => None,
                }
            };
            if let Some(record) = expired {
                log::debug!("negotiator: proposal {} timed out", record.proposal_id);
                sink.emit(FabricEvent::ProposalTimedOut {
                    proposal_id: record.proposal_id.clone(),
                })
                .await;
                let snapshot: Vec<ProposalListener> =
                    timeout_listeners.read().await.iter().cloned().collect();
                for listener in snapshot {
                    listener(&record);
                }
            }
        });
    }

    /// Ingest a `task-proposal` addressed to this agent: store a pending
    /// record under the payload's proposal id and notify the
    /// proposal-received listeners.
    pub async fn handle_incoming_proposal(
        &self,
        envelope: &Envelope,
    ) -> Result<NegotiationRecord, NegotiationError> {
        if envelope.message_type != EnvelopeType::TaskProposal {
            return Err(NegotiationError::SchemaMismatch(format!(
                "expected a task-proposal envelope, got {}",
                envelope.message_type
            )));
        }
        let correlation_id = envelope
            .correlation_id
            .clone()
            .ok_or_else(|| NegotiationError::SchemaMismatch("missing correlationId".into()))?;
        let payload: ProposalPayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| NegotiationError::SchemaMismatch(e.to_string()))?;

        let record = NegotiationRecord {
            proposal_id: payload.proposal_id.clone(),
            correlation_id,
            proposer: envelope.sender.clone(),
            target: self.factory.sender().to_string(),
            task: payload.task,
            required_capabilities: payload.required_capabilities,
            complexity: payload.complexity,
            deadline_ms: payload.deadline_ms,
            status: ProposalStatus::Pending,
            accepted_by: None,
            estimated_completion_ms: None,
            rejection_reason: None,
            alternative_suggestion: None,
        };
        self.state.write().await.insert(record.clone());

        let snapshot: Vec<ProposalListener> =
            self.proposal_listeners.read().await.iter().cloned().collect();
        for listener in snapshot {
            listener(&record);
        }
        Ok(record)
    }

    /// Accept a pending proposal: the record moves to `accepted` and a
    /// `task-accept` envelope answers the proposer on the same
    /// correlation id.
    pub async fn accept(
        &self,
        proposal_id: &str,
        estimated_completion_ms: u64,
    ) -> Result<NegotiationRecord, NegotiationError> {
        let record = {
            let mut state = self.state.write().await;
            let record = state
                .records
                .get_mut(proposal_id)
                .ok_or_else(|| NegotiationError::NotFound(proposal_id.to_string()))?;
            if record.status != ProposalStatus::Pending {
                return Err(NegotiationError::InvalidState {
                    proposal_id: proposal_id.to_string(),
                    status: record.status,
                });
            }
            record.status = ProposalStatus::Accepted;
            record.accepted_by = Some(self.factory.sender().to_string());
            record.estimated_completion_ms = Some(estimated_completion_ms);
            record.clone()
        };

        let envelope = self.factory.create_envelope(
            EnvelopeType::TaskAccept,
            record.proposer.clone(),
            serde_json::json!({
                "proposalId": record.proposal_id,
                "estimatedCompletionMs": estimated_completion_ms,
            }),
            CreateOptions {
                correlation_id: Some(record.correlation_id.clone()),
                // Answers travel back up a thread the proposer opened, so
                // they carry a standing justification for the escalation
                // gate.
                escalation: Some("response on negotiation thread".to_string()),
                ..Default::default()
            },
        );
        self.router.send(envelope).await;
        Ok(record)
    }

    /// Reject a pending proposal, optionally suggesting an alternative.
    pub async fn reject(
        &self,
        proposal_id: &str,
        reason: &str,
        alternative: Option<String>,
    ) -> Result<NegotiationRecord, NegotiationError> {
        let record = {
            let mut state = self.state.write().await;
            let record = state
                .records
                .get_mut(proposal_id)
                .ok_or_else(|| NegotiationError::NotFound(proposal_id.to_string()))?;
            if record.status != ProposalStatus::Pending {
                return Err(NegotiationError::InvalidState {
                    proposal_id: proposal_id.to_string(),
                    status: record.status,
                });
            }
            record.status = ProposalStatus::Rejected;
            record.rejection_reason = Some(reason.to_string());
            record.alternative_suggestion = alternative.clone();
            record.clone()
        };

        let envelope = self.factory.create_envelope(
            EnvelopeType::TaskReject,
            record.proposer.clone(),
            serde_json::json!({
                "proposalId": record.proposal_id,
                "reason": reason,
                "alternativeSuggestion": alternative,
            }),
            CreateOptions {
                correlation_id: Some(record.correlation_id.clone()),
                escalation: Some("response on negotiation thread".to_string()),
                ..Default::default()
            },
        );
        self.router.send(envelope).await;
        Ok(record)
    }

    /// Ingest a `task-accept` or `task-reject` answering one of this
    /// agent's outstanding proposals. The proposer's record moves to the
    /// matching terminal state; late answers arriving after the deadline
    /// already fired fail with a state violation.
    pub async fn handle_incoming_response(
        &self,
        envelope: &Envelope,
    ) -> Result<NegotiationRecord, NegotiationError> {
        let proposal_id = envelope
            .payload
            .get("proposalId")
            .and_then(|value| value.as_str())
            .ok_or_else(|| NegotiationError::SchemaMismatch("missing proposalId".into()))?
            .to_string();

        let mut state = self.state.write().await;
        let record = state
            .records
            .get_mut(&proposal_id)
            .ok_or_else(|| NegotiationError::NotFound(proposal_id.clone()))?;
        if record.status != ProposalStatus::Pending {
            return Err(NegotiationError::InvalidState {
                proposal_id,
                status: record.status,
            });
        }
        match envelope.message_type {
            EnvelopeType::TaskAccept => {
                record.status = ProposalStatus::Accepted;
                record.accepted_by = Some(envelope.sender.clone());
                record.estimated_completion_ms = envelope
                    .payload
                    .get("estimatedCompletionMs")
                    .and_then(|value| value.as_u64());
            }
            EnvelopeType::TaskReject => {
                record.status = ProposalStatus::Rejected;
                record.rejection_reason = envelope
                    .payload
                    .get("reason")
                    .and_then(|value| value.as_str())
                    .map(|reason| reason.to_string());
                record.alternative_suggestion = envelope
                    .payload
                    .get("alternativeSuggestion")
                    .and_then(|value| value.as_str())
                    .map(|alt| alt.to_string());
            }
            other => {
                return Err(NegotiationError::SchemaMismatch(format!(
                    "expected task-accept or task-reject, got {}",
                    other
                )))
            }
        }
        Ok(record.clone())
    }

    pub async fn get_proposal(&self, proposal_id: &str) -> Option<NegotiationRecord> {
        self.state.read().await.records.get(proposal_id).cloned()
    }

    /// Pending records in creation order.
    pub async fn list_pending(&self) -> Vec<NegotiationRecord> {
        self.in_order(|record| record.status == ProposalStatus::Pending)
            .await
    }

    /// All records in the given correlation thread, in creation order.
    pub async fn get_thread(&self, correlation_id: &str) -> Vec<NegotiationRecord> {
        self.in_order(|record| record.correlation_id == correlation_id)
            .await
    }

    async fn in_order<F>(&self, keep: F) -> Vec<NegotiationRecord>
    where
        F: Fn(&NegotiationRecord) -> bool,
    {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|record| keep(record))
            .cloned()
            .collect()
    }

    /// Notify on every proposal ingested by
    /// [`handle_incoming_proposal`](Self::handle_incoming_proposal).
    pub async fn on_proposal_received(&self, listener: ProposalListener) {
        self.proposal_listeners.write().await.push(listener);
    }

    /// Notify on every proposal that expires to `timed-out`.
    pub async fn on_timeout(&self, listener: ProposalListener) {
        self.timeout_listeners.write().await.push(listener);
    }
}
