//! Observability sink: structured events, listener fan-out, and
//! aggregate metrics.
//!
//! Every routing decision, channel state change, delivery failure, and
//! tool invocation in the fabric is emitted here as a [`FabricEvent`].
//! Implement [`EventListener`] and subscribe to receive every event as it
//! happens; the sink also keeps aggregate counters and a bounded log of
//! recent events for after-the-fact inspection.
//!
//! # Example
//!
//! ```rust,no_run
//! use orrery::observability::{EventListener, FabricEvent, ObservabilitySink, RecordedEvent};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventListener for Printer {
//!     async fn on_event(&self, event: &RecordedEvent) {
//!         if let FabricEvent::RoutingFailed { kind, detail, .. } = &event.event {
//!             println!("routing failed ({}): {}", kind, detail);
//!         }
//!     }
//! }
//!
//! # async {
//! let sink = ObservabilitySink::new();
//! let id = sink.subscribe(Arc::new(Printer)).await;
//! // ... run traffic ...
//! sink.unsubscribe(id).await;
//! # };
//! ```

use crate::orrery::envelope::EnvelopeType;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cap on the in-memory recent-event log.
const RECENT_EVENT_CAP: usize = 1024;

/// How an envelope left the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePath {
    Local,
    Remote,
    Broadcast,
}

impl std::fmt::Display for RoutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutePath::Local => write!(f, "local"),
            RoutePath::Remote => write!(f, "remote"),
            RoutePath::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// A structured event emitted by the fabric.
#[derive(Debug, Clone)]
pub enum FabricEvent {
    /// An envelope was delivered to its recipient's handlers.
    MessageSent {
        envelope_id: String,
        sender: String,
        recipient: String,
        message_type: EnvelopeType,
        path: RoutePath,
        latency_ms: u64,
    },
    /// A broadcast completed its fan-out.
    BroadcastSent {
        envelope_id: String,
        sender: String,
        /// Agent ids the broadcast was delivered to.
        targets: Vec<String>,
        latency_ms: u64,
    },
    /// The router refused or failed to deliver an envelope.
    RoutingFailed {
        envelope_id: Option<String>,
        sender: Option<String>,
        recipient: Option<String>,
        /// Stable error kind, e.g. `tier-violation`.
        kind: String,
        detail: String,
    },
    /// A cross-sandbox send was blocked.
    SecurityViolation {
        sender: String,
        recipient: String,
        detail: String,
    },
    /// A channel reached the open state.
    ChannelOpened {
        channel_id: String,
        local_agent: String,
        remote_agent: String,
    },
    /// A channel was closed.
    ChannelClosed { channel_id: String },
    /// A channel exhausted its delivery retries for one envelope.
    DeliveryFailed {
        channel_id: String,
        envelope_id: String,
        attempts: u32,
    },
    /// A task proposal expired without resolution.
    ProposalTimedOut { proposal_id: String },
    /// Every sub-task of a swarm completed.
    SwarmCompleted { swarm_id: String },
    /// A swarm failed with an unreassignable sub-task.
    SwarmFailed { swarm_id: String },
    /// A bridge tool was invoked.
    ToolInvoked {
        tool_name: String,
        duration_ms: u64,
        success: bool,
    },
}

/// A [`FabricEvent`] stamped with its emission time (wall-clock ms).
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub event: FabricEvent,
    pub timestamp_ms: i64,
}

/// Trait for receiving fabric events.
///
/// The `Send + Sync` bound allows listeners to be shared across tokio
/// tasks via `Arc<dyn EventListener>`; keep internal state behind its own
/// synchronization.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &RecordedEvent);
}

/// Subscription handle returned by [`ObservabilitySink::subscribe`].
pub type ListenerId = u64;

/// Aggregate counters maintained by the sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkMetrics {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub broadcasts: u64,
    pub tool_invocations: u64,
    pub security_violations: u64,
    /// Mean latency over all `MessageSent` events, milliseconds.
    pub avg_send_latency_ms: f64,
}

#[derive(Default)]
struct MetricsInner {
    messages_sent: u64,
    messages_failed: u64,
    broadcasts: u64,
    tool_invocations: u64,
    security_violations: u64,
    total_send_latency_ms: u64,
}

/// The event sink backing the router and every higher-level component.
pub struct ObservabilitySink {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EventListener>)>>,
    next_listener: AtomicU64,
    recent: RwLock<VecDeque<RecordedEvent>>,
    metrics: RwLock<MetricsInner>,
}

impl ObservabilitySink {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            recent: RwLock::new(VecDeque::new()),
            metrics: RwLock::new(MetricsInner::default()),
        }
    }

    /// Subscribe a listener; it receives every event emitted after this
    /// call returns.
    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().await.push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was subscribed.
    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Record an event, update the aggregates, and fan out to a snapshot
    /// of the current listeners.
    pub async fn emit(&self, event: FabricEvent) {
        let recorded = RecordedEvent {
            event,
            timestamp_ms: Utc::now().timestamp_millis(),
        };

        {
            let mut metrics = self.metrics.write().await;
            match &recorded.event {
                FabricEvent::MessageSent { latency_ms, .. } => {
                    metrics.messages_sent += 1;
                    metrics.total_send_latency_ms += *latency_ms;
                }
                FabricEvent::BroadcastSent { .. } => metrics.broadcasts += 1,
                FabricEvent::RoutingFailed { .. } | FabricEvent::DeliveryFailed { .. } => {
                    metrics.messages_failed += 1
                }
                FabricEvent::SecurityViolation { .. } => metrics.security_violations += 1,
                FabricEvent::ToolInvoked { .. } => metrics.tool_invocations += 1,
                _ => {}
            }
        }

        {
            let mut recent = self.recent.write().await;
            if recent.len() == RECENT_EVENT_CAP {
                recent.pop_front();
            }
            recent.push_back(recorded.clone());
        }

        // Snapshot before awaiting so a listener that mutates the
        // subscription table cannot deadlock or skip peers.
        let snapshot: Vec<Arc<dyn EventListener>> = self
            .listeners
            .read()
            .await
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener.on_event(&recorded).await;
        }
    }

    /// Current aggregate counters.
    pub async fn metrics(&self) -> SinkMetrics {
        let inner = self.metrics.read().await;
        SinkMetrics {
            messages_sent: inner.messages_sent,
            messages_failed: inner.messages_failed,
            broadcasts: inner.broadcasts,
            tool_invocations: inner.tool_invocations,
            security_violations: inner.security_violations,
            avg_send_latency_ms: if inner.messages_sent == 0 {
                0.0
            } else {
                inner.total_send_latency_ms as f64 / inner.messages_sent as f64
            },
        }
    }

    /// The most recent `n` events, oldest first.
    pub async fn recent_events(&self, n: usize) -> Vec<RecordedEvent> {
        let recent = self.recent.read().await;
        let skip = recent.len().saturating_sub(n);
        recent.iter().skip(skip).cloned().collect()
    }
}

impl Default for ObservabilitySink {
    fn default() -> Self {
        Self::new()
    }
}
