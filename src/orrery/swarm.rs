//! Decentralized swarm coordination: recruitment, assignment,
//! reassignment, and shared-state aggregation.
//!
//! A coordinator creates a [`SwarmSession`] for a task, recruits every
//! registered agent advertising at least one required capability by
//! sending each a `task-proposal`, and hands out sub-tasks as agents
//! join. Sub-task results aggregate into the session's shared state; a
//! failed sub-task is reassigned to the earliest-joined other
//! participant, and a failure with nobody left to take over fails the
//! whole swarm.
//!
//! The session is owned by the coordinator that created it. Participants
//! only ever see the envelopes the coordinator sends.

use crate::orrery::envelope::EnvelopeFactory;
use crate::orrery::observability::{FabricEvent, ObservabilitySink};
use crate::orrery::registry::AgentRegistry;
use crate::orrery::router::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Swarm lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwarmStatus {
    /// Proposals are out; nobody has joined yet.
    Recruiting,
    /// At least one participant is working.
    Active,
    /// Last sub-task finished; results are being sealed.
    Completing,
    Completed,
    Failed,
}

/// State of one unit of work inside a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A unit of work assigned to one participant at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    pub required_capabilities: Vec<String>,
    pub status: SubTaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// A transient coalition of agents cooperating on one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmSession {
    pub swarm_id: String,
    pub task_description: String,
    /// Agent ids in join order; join order drives reassignment.
    pub participants: Vec<String>,
    pub sub_tasks: Vec<SubTask>,
    pub status: SwarmStatus,
    pub shared_state: HashMap<String, serde_json::Value>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl SwarmSession {
    fn is_settled(&self) -> bool {
        matches!(self.status, SwarmStatus::Completed | SwarmStatus::Failed)
    }
}

/// Errors raised by swarm operations.
#[derive(Debug, Clone)]
pub enum SwarmError {
    SwarmNotFound(String),
    SubTaskNotFound { swarm_id: String, sub_task_id: String },
    /// Joining or mutating a swarm that already settled.
    InvalidState { swarm_id: String, status: SwarmStatus },
}

impl SwarmError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SwarmError::SwarmNotFound(_) | SwarmError::SubTaskNotFound { .. } => "not-found",
            SwarmError::InvalidState { .. } => "state-violation",
        }
    }
}

impl fmt::Display for SwarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwarmError::SwarmNotFound(id) => write!(f, "Swarm not found: {}", id),
            SwarmError::SubTaskNotFound {
                swarm_id,
                sub_task_id,
            } => write!(f, "Sub-task {} not found in swarm {}", sub_task_id, swarm_id),
            SwarmError::InvalidState { swarm_id, status } => {
                write!(f, "Swarm {} is already {:?}", swarm_id, status)
            }
        }
    }
}

impl Error for SwarmError {}

#[derive(Default)]
struct SwarmTable {
    swarms: HashMap<String, SwarmSession>,
    /// Creation order, for deterministic listings.
    order: Vec<String>,
}

/// Creates and owns swarm sessions, recruiting through the router.
pub struct SwarmCoordinator {
    factory: EnvelopeFactory,
    router: Arc<Router>,
    registry: Arc<AgentRegistry>,
    sink: Arc<ObservabilitySink>,
    table: RwLock<SwarmTable>,
}

impl SwarmCoordinator {
    pub fn new(
        factory: EnvelopeFactory,
        router: Arc<Router>,
        registry: Arc<AgentRegistry>,
        sink: Arc<ObservabilitySink>,
    ) -> Self {
        Self {
            factory,
            router,
            registry,
            sink,
            table: RwLock::new(SwarmTable::default()),
        }
    }

    /// Create a swarm: one pending sub-task per description, and one
    /// recruitment `task-proposal` to every registered agent advertising
    /// at least one required capability (the coordinator itself is never
    /// recruited).
    pub async fn create_swarm(
        &self,
        description: &str,
        required_capabilities: Vec<String>,
        sub_task_descriptions: Vec<String>,
    ) -> SwarmSession {
        let swarm_id = Uuid::new_v4().to_string();

        // Union of providers over the required capabilities, first-seen
        // registration order preserved.
        let mut candidates: Vec<String> = Vec::new();
        for capability in &required_capabilities {
            for card in self.registry.find_by_capability(capability).await {
                if card.id != self.factory.sender() && !candidates.contains(&card.id) {
                    candidates.push(card.id);
                }
            }
        }

        let session = SwarmSession {
            swarm_id: swarm_id.clone(),
            task_description: description.to_string(),
            participants: Vec::new(),
            sub_tasks: sub_task_descriptions
                .into_iter()
                .map(|description| SubTask {
                    id: Uuid::new_v4().to_string(),
                    description,
                    assigned_agent: None,
                    required_capabilities: required_capabilities.clone(),
                    status: SubTaskStatus::Pending,
                    result: None,
                })
                .collect(),
            status: SwarmStatus::Recruiting,
            shared_state: HashMap::new(),
            created_at: Utc::now().timestamp_millis(),
            completed_at: None,
        };
        // Store before recruiting so an eager candidate can join the
        // moment its proposal lands.
        {
            let mut table = self.table.write().await;
            table.swarms.insert(swarm_id.clone(), session.clone());
            table.order.push(swarm_id.clone());
        }

        let correlation_id = Uuid::new_v4().to_string();
        for candidate in &candidates {
            let envelope = self.factory.create_task_proposal(
                candidate.clone(),
                serde_json::json!({
                    "swarmId": swarm_id,
                    "task": description,
                    "requiredCapabilities": required_capabilities,
                }),
                Some(correlation_id.clone()),
            );
            let routing = self.router.send(envelope).await;
            if !routing.delivered {
                log::debug!(
                    "swarm {}: recruitment of {} not delivered ({:?})",
                    swarm_id,
                    candidate,
                    routing.error.map(|e| e.kind())
                );
            }
        }
        log::debug!(
            "swarm {}: recruiting {} candidate(s) for {} sub-task(s)",
            swarm_id,
            candidates.len(),
            session.sub_tasks.len()
        );
        session
    }

    /// An agent joins the swarm: it becomes a participant and is handed
    /// the earliest pending sub-task, if any. The swarm goes active on
    /// the first join. Joining a settled swarm fails.
    pub async fn join_swarm(
        &self,
        swarm_id: &str,
        agent_id: &str,
    ) -> Result<Option<SubTask>, SwarmError> {
        let mut table = self.table.write().await;
        let session = table
            .swarms
            .get_mut(swarm_id)
            .ok_or_else(|| SwarmError::SwarmNotFound(swarm_id.to_string()))?;
        if session.is_settled() {
            return Err(SwarmError::InvalidState {
                swarm_id: swarm_id.to_string(),
                status: session.status,
            });
        }

        if !session.participants.iter().any(|p| p == agent_id) {
            session.participants.push(agent_id.to_string());
        }
        session.status = SwarmStatus::Active;

        let assigned = session
            .sub_tasks
            .iter_mut()
            .find(|sub_task| sub_task.status == SubTaskStatus::Pending)
            .map(|sub_task| {
                sub_task.assigned_agent = Some(agent_id.to_string());
                sub_task.status = SubTaskStatus::Running;
                sub_task.clone()
            });
        log::debug!(
            "swarm {}: {} joined ({})",
            swarm_id,
            agent_id,
            assigned
                .as_ref()
                .map(|s| s.id.as_str())
                .unwrap_or("no pending sub-task")
        );
        Ok(assigned)
    }

    /// Mark a sub-task completed and fold its result into the shared
    /// state under the sub-task id. When every sub-task has completed the
    /// swarm settles as completed.
    pub async fn complete_sub_task(
        &self,
        swarm_id: &str,
        sub_task_id: &str,
        result: serde_json::Value,
    ) -> Result<(), SwarmError> {
        let finished = {
            let mut table = self.table.write().await;
            let session = table
                .swarms
                .get_mut(swarm_id)
                .ok_or_else(|| SwarmError::SwarmNotFound(swarm_id.to_string()))?;
            let sub_task = session
                .sub_tasks
                .iter_mut()
                .find(|sub_task| sub_task.id == sub_task_id)
                .ok_or_else(|| SwarmError::SubTaskNotFound {
                    swarm_id: swarm_id.to_string(),
                    sub_task_id: sub_task_id.to_string(),
                })?;
            sub_task.status = SubTaskStatus::Completed;
            sub_task.result = Some(result.clone());
            session
                .shared_state
                .insert(sub_task_id.to_string(), result);

            if session
                .sub_tasks
                .iter()
                .all(|sub_task| sub_task.status == SubTaskStatus::Completed)
            {
                session.status = SwarmStatus::Completing;
                session.completed_at = Some(Utc::now().timestamp_millis());
                session.status = SwarmStatus::Completed;
                true
            } else {
                false
            }
        };
        if finished {
            log::debug!("swarm {}: completed", swarm_id);
            self.sink
                .emit(FabricEvent::SwarmCompleted {
                    swarm_id: swarm_id.to_string(),
                })
                .await;
        }
        Ok(())
    }

    /// Report a sub-task failure. The sub-task is reassigned to the
    /// earliest-joined participant other than the failed assignee; if no
    /// such participant exists the sub-task and the whole swarm fail.
    /// Returns `(reassigned, new_agent)`.
    pub async fn fail_sub_task(
        &self,
        swarm_id: &str,
        sub_task_id: &str,
        reason: &str,
    ) -> Result<(bool, Option<String>), SwarmError> {
        let outcome = {
            let mut table = self.table.write().await;
            let session = table
                .swarms
                .get_mut(swarm_id)
                .ok_or_else(|| SwarmError::SwarmNotFound(swarm_id.to_string()))?;

            let participants = session.participants.clone();
            let sub_task = session
                .sub_tasks
                .iter_mut()
                .find(|sub_task| sub_task.id == sub_task_id)
                .ok_or_else(|| SwarmError::SubTaskNotFound {
                    swarm_id: swarm_id.to_string(),
                    sub_task_id: sub_task_id.to_string(),
                })?;

            let failed_assignee = sub_task.assigned_agent.clone();
            let replacement = participants
                .iter()
                .find(|participant| Some(participant.as_str()) != failed_assignee.as_deref())
                .cloned();

            match replacement {
                Some(new_agent) => {
                    log::debug!(
                        "swarm {}: sub-task {} reassigned {} -> {} ({})",
                        swarm_id,
                        sub_task_id,
                        failed_assignee.as_deref().unwrap_or("unassigned"),
                        new_agent,
                        reason
                    );
                    sub_task.assigned_agent = Some(new_agent.clone());
                    sub_task.status = SubTaskStatus::Running;
                    (true, Some(new_agent))
                }
                None => {
                    log::warn!(
                        "swarm {}: sub-task {} failed with no reassignment target ({})",
                        swarm_id,
                        sub_task_id,
                        reason
                    );
                    sub_task.status = SubTaskStatus::Failed;
                    session.status = SwarmStatus::Failed;
                    (false, None)
                }
            }
        };
        if !outcome.0 {
            self.sink
                .emit(FabricEvent::SwarmFailed {
                    swarm_id: swarm_id.to_string(),
                })
                .await;
        }
        Ok(outcome)
    }

    /// Participant-contributed shared state, available between
    /// aggregation rounds.
    pub async fn update_shared_state(
        &self,
        swarm_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), SwarmError> {
        let mut table = self.table.write().await;
        let session = table
            .swarms
            .get_mut(swarm_id)
            .ok_or_else(|| SwarmError::SwarmNotFound(swarm_id.to_string()))?;
        session.shared_state.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn get_swarm(&self, swarm_id: &str) -> Option<SwarmSession> {
        self.table.read().await.swarms.get(swarm_id).cloned()
    }

    /// Swarms still recruiting or active, in creation order.
    pub async fn list_active_swarms(&self) -> Vec<SwarmSession> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter_map(|id| table.swarms.get(id))
            .filter(|session| {
                matches!(session.status, SwarmStatus::Recruiting | SwarmStatus::Active)
            })
            .cloned()
            .collect()
    }

    /// Aggregated shared state of a completed swarm.
    pub async fn swarm_results(
        &self,
        swarm_id: &str,
    ) -> Result<HashMap<String, serde_json::Value>, SwarmError> {
        let table = self.table.read().await;
        let session = table
            .swarms
            .get(swarm_id)
            .ok_or_else(|| SwarmError::SwarmNotFound(swarm_id.to_string()))?;
        if session.status != SwarmStatus::Completed {
            return Err(SwarmError::InvalidState {
                swarm_id: swarm_id.to_string(),
                status: session.status,
            });
        }
        Ok(session.shared_state.clone())
    }
}
