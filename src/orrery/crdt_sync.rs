//! CRDT propagation channel with vector-clock causality.
//!
//! Each [`CrdtSyncChannel`] is bound to one local agent and one named
//! operation log. [`broadcast`](CrdtSyncChannel::broadcast) increments
//! the local clock entry and fans the operation out as a `stream-data`
//! broadcast; [`apply_update`](CrdtSyncChannel::apply_update) merges the
//! incoming clock component-wise and notifies subscribers.
//!
//! Ingest is tolerant: a malformed message never raises. It lands in
//! the channel's error log and the clock stays untouched. Merges are
//! confluent: applying any permutation of a set of updates yields the
//! same final clock, which is what lets the consumed CRDT engine
//! converge.

use crate::orrery::envelope::{CreateOptions, EnvelopeFactory, EnvelopeType, BROADCAST_RECIPIENT};
use crate::orrery::router::Router;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Cap on the per-channel ingest error log.
const ERROR_LOG_CAP: usize = 64;

/// Mapping from agent id to a monotone counter, used for causal ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(HashMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// The counter for an agent; absent entries read as zero.
    pub fn get(&self, agent_id: &str) -> u64 {
        self.0.get(agent_id).copied().unwrap_or(0)
    }

    /// Bump an agent's entry by one and return the new value.
    pub fn increment(&mut self, agent_id: &str) -> u64 {
        let entry = self.0.entry(agent_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Component-wise max merge. No entry ever regresses, so the result
    /// dominates both inputs.
    pub fn merge(&mut self, other: &VectorClock) {
        for (agent_id, remote) in &other.0 {
            let entry = self.0.entry(agent_id.clone()).or_insert(0);
            if *remote > *entry {
                *entry = *remote;
            }
        }
    }

    /// Whether every entry of `other` is ≤ the matching entry here.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .0
            .iter()
            .all(|(agent_id, remote)| self.get(agent_id) >= *remote)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One CRDT operation on the wire, carried inside a `stream-data`
/// broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtSyncMessage {
    pub operation_id: String,
    pub vector_clock: VectorClock,
    pub payload: serde_json::Value,
    pub log_name: String,
    /// The sender's outbound sequence number on this channel.
    pub seq: u64,
}

impl CrdtSyncMessage {
    /// Structural validation of an incoming value. The required fields
    /// must be present with the right types; anything else is a schema
    /// mismatch.
    pub fn validate(value: &serde_json::Value) -> Result<CrdtSyncMessage, SyncError> {
        serde_json::from_value(value.clone())
            .map_err(|e| SyncError::SchemaMismatch(e.to_string()))
    }
}

/// Errors raised by the sync channel.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Broadcast on a closed channel.
    Closed,
    /// An incoming message failed structural validation.
    SchemaMismatch(String),
}

impl SyncError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Closed => "state-violation",
            SyncError::SchemaMismatch(_) => "schema-mismatch",
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Closed => write!(f, "Sync channel is closed"),
            SyncError::SchemaMismatch(msg) => write!(f, "Malformed sync message: {}", msg),
        }
    }
}

impl Error for SyncError {}

/// Subscriber invoked for every successfully applied update.
pub type UpdateHandler = Arc<dyn Fn(&CrdtSyncMessage) + Send + Sync>;

/// Handle returned by [`CrdtSyncChannel::on_update`].
pub type UpdateHandlerId = u64;

/// Causal broadcast channel for one agent on one operation log.
pub struct CrdtSyncChannel {
    agent_id: String,
    log_name: String,
    factory: EnvelopeFactory,
    router: Arc<Router>,
    clock: RwLock<VectorClock>,
    seq: AtomicU64,
    handlers: RwLock<Vec<(UpdateHandlerId, UpdateHandler)>>,
    next_handler: AtomicU64,
    error_log: RwLock<VecDeque<String>>,
    closed: AtomicBool,
}

impl CrdtSyncChannel {
    pub fn new(
        agent_id: impl Into<String>,
        log_name: impl Into<String>,
        factory: EnvelopeFactory,
        router: Arc<Router>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            log_name: log_name.into(),
            factory,
            router,
            clock: RwLock::new(VectorClock::new()),
            seq: AtomicU64::new(0),
            handlers: RwLock::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            error_log: RwLock::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    /// Publish an operation: bump the local clock entry, snapshot it into
    /// a [`CrdtSyncMessage`], and broadcast it as `stream-data`. Each
    /// outbound message strictly increases both `seq` and the local
    /// clock entry.
    pub async fn broadcast(
        &self,
        payload: serde_json::Value,
    ) -> Result<CrdtSyncMessage, SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }

        let clock_snapshot = {
            let mut clock = self.clock.write().await;
            clock.increment(&self.agent_id);
            clock.clone()
        };
        let message = CrdtSyncMessage {
            operation_id: Uuid::new_v4().to_string(),
            vector_clock: clock_snapshot,
            payload,
            log_name: self.log_name.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
        };

        let envelope = self.factory.create_envelope(
            EnvelopeType::StreamData,
            BROADCAST_RECIPIENT,
            serde_json::to_value(&message)
                .map_err(|e| SyncError::SchemaMismatch(e.to_string()))?,
            CreateOptions::default(),
        );
        self.router.send(envelope).await;
        Ok(message)
    }

    /// Ingest an incoming operation. Schema failures are logged and
    /// swallowed (`false`); valid messages merge their clock into the
    /// local one and notify every subscriber (`true`).
    pub async fn apply_update(&self, value: &serde_json::Value) -> bool {
        let message = match CrdtSyncMessage::validate(value) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("crdt sync {}: {}", self.log_name, e);
                let mut error_log = self.error_log.write().await;
                if error_log.len() == ERROR_LOG_CAP {
                    error_log.pop_front();
                }
                error_log.push_back(e.to_string());
                return false;
            }
        };

        self.clock.write().await.merge(&message.vector_clock);

        let snapshot: Vec<UpdateHandler> = self
            .handlers
            .read()
            .await
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in snapshot {
            handler(&message);
        }
        true
    }

    /// Subscribe to applied updates.
    pub async fn on_update(&self, handler: UpdateHandler) -> UpdateHandlerId {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().await.push((id, handler));
        id
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub async fn remove_handler(&self, handler_id: UpdateHandlerId) -> bool {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != handler_id);
        handlers.len() != before
    }

    /// Snapshot of the local vector clock.
    pub async fn get_vector_clock(&self) -> VectorClock {
        self.clock.read().await.clone()
    }

    /// Messages rejected during ingest, oldest first, capped.
    pub async fn error_log(&self) -> Vec<String> {
        self.error_log.read().await.iter().cloned().collect()
    }

    /// Close the channel; further broadcasts fail. Ingest and reads keep
    /// working so a closing peer can still drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orrery::observability::ObservabilitySink;
    use crate::orrery::registry::AgentRegistry;
    use std::sync::Mutex as StdMutex;

    fn channel(agent: &str) -> CrdtSyncChannel {
        let registry = Arc::new(AgentRegistry::new());
        let sink = Arc::new(ObservabilitySink::new());
        let router = Arc::new(Router::new(registry, sink));
        CrdtSyncChannel::new(agent, "test-log", EnvelopeFactory::new(agent), router)
    }

    fn message(sender: &str, clock: &[(&str, u64)], seq: u64) -> serde_json::Value {
        let clock: HashMap<String, u64> = clock
            .iter()
            .map(|(id, count)| (id.to_string(), *count))
            .collect();
        serde_json::json!({
            "operationId": format!("op-{}-{}", sender, seq),
            "vectorClock": clock,
            "payload": {"from": sender},
            "logName": "test-log",
            "seq": seq,
        })
    }

    #[tokio::test]
    async fn broadcast_strictly_increments_the_own_entry() {
        let channel = channel("mars");
        let first = channel.broadcast(serde_json::json!({"op": 1})).await.unwrap();
        let second = channel.broadcast(serde_json::json!({"op": 2})).await.unwrap();

        assert_eq!(first.vector_clock.get("mars"), 1);
        assert_eq!(second.vector_clock.get("mars"), 2);
        assert!(second.seq > first.seq);
        assert_ne!(first.operation_id, second.operation_id);
    }

    #[tokio::test]
    async fn apply_update_merges_without_regressing_entries() {
        let channel = channel("mars");
        channel.broadcast(serde_json::json!({})).await.unwrap();

        // Remote clock with a stale local entry and a fresh peer entry.
        assert!(
            channel
                .apply_update(&message("venus", &[("mars", 0), ("venus", 3)], 3))
                .await
        );
        let clock = channel.get_vector_clock().await;
        assert_eq!(clock.get("mars"), 1);
        assert_eq!(clock.get("venus"), 3);
        assert!(clock.dominates(&VectorClock::new()));
    }

    #[tokio::test]
    async fn merge_is_confluent_over_permutations() {
        let updates = vec![
            message("venus", &[("venus", 1)], 1),
            message("pluto", &[("pluto", 1), ("venus", 1)], 1),
            message("venus", &[("venus", 2), ("pluto", 1)], 2),
        ];

        let forward = channel("mars");
        for update in &updates {
            assert!(forward.apply_update(update).await);
        }
        let backward = channel("mars");
        for update in updates.iter().rev() {
            assert!(backward.apply_update(update).await);
        }

        assert_eq!(
            forward.get_vector_clock().await,
            backward.get_vector_clock().await
        );
    }

    #[tokio::test]
    async fn malformed_updates_are_swallowed_and_logged() {
        let channel = channel("mars");
        channel.broadcast(serde_json::json!({})).await.unwrap();
        let before = channel.get_vector_clock().await;

        assert!(!channel.apply_update(&serde_json::json!({"garbage": true})).await);
        assert!(
            !channel
                .apply_update(&serde_json::json!({
                    "operationId": "x",
                    "vectorClock": {"mars": "not-a-number"},
                    "payload": {},
                    "logName": "test-log",
                    "seq": 1,
                }))
                .await
        );

        assert_eq!(channel.get_vector_clock().await, before);
        assert_eq!(channel.error_log().await.len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_applied_updates_until_removed() {
        let channel = channel("mars");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let id = {
            let seen = seen.clone();
            channel
                .on_update(Arc::new(move |message: &CrdtSyncMessage| {
                    seen.lock().unwrap().push(message.operation_id.clone());
                }))
                .await
        };

        channel
            .apply_update(&message("venus", &[("venus", 1)], 1))
            .await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(channel.remove_handler(id).await);
        channel
            .apply_update(&message("venus", &[("venus", 2)], 2))
            .await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_channel_rejects_broadcasts_but_still_ingests() {
        let channel = channel("mars");
        channel.close();
        assert!(channel.is_closed());

        let err = channel.broadcast(serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "state-violation");

        assert!(
            channel
                .apply_update(&message("venus", &[("venus", 1)], 1))
                .await
        );
        assert_eq!(channel.get_vector_clock().await.get("venus"), 1);
    }
}
