//! Envelope router: recipient resolution, tier and sandbox enforcement,
//! and handler dispatch.
//!
//! The router is the single choke point every envelope passes through.
//! Unicast sends resolve the recipient in the registry, check the tier
//! policy (including the escalation gate), check sandbox boundaries, and
//! dispatch to every handler registered for the recipient. Broadcasts fan
//! out to all other registered agents with the same checks applied per
//! target. Capability routing resolves the first registered agent
//! advertising the capability.
//!
//! ```text
//! EnvelopeFactory → Router ── registry lookup ──┐
//!                     │                         ├─ tier policy
//!                     │                         ├─ sandbox allow-list
//!                     ▼                         ▼
//!               ReceiveHandler(s)      ObservabilitySink
//! ```
//!
//! Every terminal outcome, whether delivery, refusal, or a missing handler, is
//! emitted to the observability sink exactly once and reflected in the
//! returned [`RoutingResult`]; the router never panics on bad traffic.
//!
//! Handlers are stored behind integer [`HandlerId`]s rather than an
//! owning graph, so a handler may itself hold the router and send replies
//! without creating a reference cycle.

use crate::orrery::envelope::Envelope;
use crate::orrery::observability::{FabricEvent, ObservabilitySink, RoutePath};
use crate::orrery::registry::{AgentCard, AgentRegistry, CardOrigin};
use crate::orrery::tier::{default_agent_tier, Tier, TierPolicy};
use futures_util::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Routing hint value that makes the router read `recipient` as a
/// capability name.
pub const CAPABILITY_HINT: &str = "capability";

/// Async per-agent delivery handler. Registered under an integer id so
/// unsubscribing never has to compare closures.
pub type ReceiveHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by [`Router::on_receive`].
pub type HandlerId = u64;

/// Errors a send can terminate with. Carried inside [`RoutingResult`]
/// rather than returned, so callers always get the path and latency.
#[derive(Debug, Clone)]
pub enum RouterError {
    /// No card for the recipient (or the sender, under enforcement).
    NotFound(String),
    /// The tier policy denies this (source, target) pair, or the send
    /// lacks a required escalation justification.
    TierViolation {
        src: Tier,
        tgt: Tier,
        detail: String,
    },
    /// Cross-sandbox send without an allow-list grant.
    SandboxViolation { sender: String, recipient: String },
    /// The recipient resolved but has no registered handler.
    NoHandler(String),
}

impl RouterError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::NotFound(_) => "not-found",
            RouterError::TierViolation { .. } => "tier-violation",
            RouterError::SandboxViolation { .. } => "sandbox-violation",
            RouterError::NoHandler(_) => "delivery-failed",
        }
    }
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::NotFound(id) => write!(f, "Agent not found: {}", id),
            RouterError::TierViolation { src, tgt, detail } => {
                write!(f, "Tier violation: {} -> {} ({})", src, tgt, detail)
            }
            RouterError::SandboxViolation { sender, recipient } => write!(
                f,
                "Sandbox violation: {} may not reach {} across sandboxes",
                sender, recipient
            ),
            RouterError::NoHandler(id) => write!(f, "No handler registered for {}", id),
        }
    }
}

impl Error for RouterError {}

/// Outcome of a [`Router::send`] call.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub delivered: bool,
    pub path: RoutePath,
    /// Resolved recipient id, or `"*"` for broadcasts.
    pub target_id: String,
    /// Monotonic-clock time spent in resolution and dispatch.
    pub latency_ms: u64,
    pub error: Option<RouterError>,
}

/// The envelope router. Cheap to share: hold it in an `Arc` and clone
/// that into handlers and higher-level components.
pub struct Router {
    registry: Arc<AgentRegistry>,
    sink: Arc<ObservabilitySink>,
    policy: TierPolicy,
    enforce_tiers: bool,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, ReceiveHandler)>>>,
    next_handler: AtomicU64,
    /// sandbox id → recipient agent ids it may reach outside itself.
    sandbox_allow: RwLock<HashMap<String, HashSet<String>>>,
}

impl Router {
    pub fn new(registry: Arc<AgentRegistry>, sink: Arc<ObservabilitySink>) -> Self {
        Self {
            registry,
            sink,
            policy: TierPolicy::default(),
            enforce_tiers: true,
            handlers: RwLock::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            sandbox_allow: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the default tier policy.
    pub fn with_policy(mut self, policy: TierPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Toggle tier enforcement (on by default). Sandbox checks are not
    /// affected.
    pub fn with_tier_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_tiers = enforce;
        self
    }

    /// Register a delivery handler for an agent id. Multiple handlers per
    /// id are supported; each invocation receives its own clone of the
    /// envelope.
    pub async fn on_receive(&self, agent_id: impl Into<String>, handler: ReceiveHandler) -> HandlerId {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .await
            .entry(agent_id.into())
            .or_insert_with(Vec::new)
            .push((id, handler));
        id
    }

    /// Remove one previously registered handler. Returns whether it was
    /// found.
    pub async fn remove_handler(&self, agent_id: &str, handler_id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().await;
        match handlers.get_mut(agent_id) {
            Some(list) => {
                let before = list.len();
                list.retain(|(id, _)| *id != handler_id);
                list.len() != before
            }
            None => false,
        }
    }

    /// Grant a sandbox permission to reach one recipient outside itself.
    pub async fn allow_cross_sandbox(&self, sandbox_id: impl Into<String>, recipient_id: impl Into<String>) {
        self.sandbox_allow
            .write()
            .await
            .entry(sandbox_id.into())
            .or_insert_with(HashSet::new)
            .insert(recipient_id.into());
    }

    /// Revoke a previously granted cross-sandbox exception.
    pub async fn revoke_cross_sandbox(&self, sandbox_id: &str, recipient_id: &str) {
        if let Some(allowed) = self.sandbox_allow.write().await.get_mut(sandbox_id) {
            allowed.remove(recipient_id);
        }
    }

    /// Route an envelope: unicast, broadcast (`recipient = "*"`), or
    /// capability-hinted. Never returns `Err`; failures ride inside the
    /// result.
    pub async fn send(&self, envelope: Envelope) -> RoutingResult {
        let start = Instant::now();
        if envelope.is_broadcast() {
            return self.broadcast(envelope, start).await;
        }
        if envelope.routing_hint() == Some(CAPABILITY_HINT) {
            let capability = envelope.recipient.clone();
            return self.send_to_capability(envelope, &capability, start).await;
        }
        self.unicast(envelope, start).await
    }

    /// Resolve the first registered agent advertising `capability_name`
    /// (registration order breaks ties) and deliver to it.
    pub async fn route_by_capability(
        &self,
        envelope: Envelope,
        capability_name: &str,
    ) -> RoutingResult {
        let start = Instant::now();
        self.send_to_capability(envelope, capability_name, start).await
    }

    async fn send_to_capability(
        &self,
        mut envelope: Envelope,
        capability_name: &str,
        start: Instant,
    ) -> RoutingResult {
        let matches = self.registry.find_by_capability(capability_name).await;
        match matches.into_iter().next() {
            Some(card) => {
                envelope.recipient = card.id.clone();
                self.unicast(envelope, start).await
            }
            None => {
                let error = RouterError::NotFound(format!(
                    "no agent provides capability '{}'",
                    capability_name
                ));
                self.fail(&envelope, capability_name, error, start).await
            }
        }
    }

    async fn unicast(&self, envelope: Envelope, start: Instant) -> RoutingResult {
        let recipient_card = match self.registry.get_by_id(&envelope.recipient).await {
            Some(card) => card,
            None => {
                let error = RouterError::NotFound(envelope.recipient.clone());
                let target = envelope.recipient.clone();
                return self.fail(&envelope, &target, error, start).await;
            }
        };

        if self.enforce_tiers {
            let src_tier = match self.sender_tier(&envelope).await {
                Some(tier) => tier,
                None => {
                    let error = RouterError::NotFound(envelope.sender.clone());
                    let target = envelope.recipient.clone();
                    return self.fail(&envelope, &target, error, start).await;
                }
            };
            if let Some(error) = self.tier_check(&envelope, src_tier, recipient_card.tier) {
                let target = envelope.recipient.clone();
                return self.fail(&envelope, &target, error, start).await;
            }
        }

        if let Some(error) = self.sandbox_check(&envelope, &recipient_card).await {
            self.sink
                .emit(FabricEvent::SecurityViolation {
                    sender: envelope.sender.clone(),
                    recipient: recipient_card.id.clone(),
                    detail: error.to_string(),
                })
                .await;
            log::warn!("router: {}", error);
            return RoutingResult {
                delivered: false,
                path: Self::path_for(&recipient_card),
                target_id: recipient_card.id,
                latency_ms: start.elapsed().as_millis() as u64,
                error: Some(error),
            };
        }

        let path = Self::path_for(&recipient_card);
        let delivered = self.dispatch(&recipient_card.id, &envelope).await;
        if delivered == 0 {
            let error = RouterError::NoHandler(recipient_card.id.clone());
            return self.fail(&envelope, &recipient_card.id, error, start).await;
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        self.sink
            .emit(FabricEvent::MessageSent {
                envelope_id: envelope.id.clone(),
                sender: envelope.sender.clone(),
                recipient: recipient_card.id.clone(),
                message_type: envelope.message_type,
                path,
                latency_ms,
            })
            .await;
        log::debug!(
            "router: {} -> {} ({}, {} handler(s))",
            envelope.sender,
            recipient_card.id,
            envelope.message_type,
            delivered
        );
        RoutingResult {
            delivered: true,
            path,
            target_id: recipient_card.id,
            latency_ms,
            error: None,
        }
    }

    async fn broadcast(&self, envelope: Envelope, start: Instant) -> RoutingResult {
        let src_tier = if self.enforce_tiers {
            match self.sender_tier(&envelope).await {
                Some(tier) => Some(tier),
                None => {
                    let error = RouterError::NotFound(envelope.sender.clone());
                    return self.fail(&envelope, "*", error, start).await;
                }
            }
        } else {
            None
        };

        let mut delivered_to = Vec::new();
        for card in self.registry.list_all().await {
            if card.id == envelope.sender {
                continue;
            }
            if let Some(src) = src_tier {
                if self.tier_check(&envelope, src, card.tier).is_some() {
                    log::debug!(
                        "router: broadcast {} skips {} (tier {} -> {})",
                        envelope.id,
                        card.id,
                        src,
                        card.tier
                    );
                    continue;
                }
            }
            if self.sandbox_check(&envelope, &card).await.is_some() {
                log::debug!(
                    "router: broadcast {} skips {} (sandbox boundary)",
                    envelope.id,
                    card.id
                );
                continue;
            }
            if self.dispatch(&card.id, &envelope).await > 0 {
                delivered_to.push(card.id.clone());
            }
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        let delivered = !delivered_to.is_empty();
        self.sink
            .emit(FabricEvent::BroadcastSent {
                envelope_id: envelope.id.clone(),
                sender: envelope.sender.clone(),
                targets: delivered_to,
                latency_ms,
            })
            .await;
        RoutingResult {
            delivered,
            path: RoutePath::Broadcast,
            target_id: envelope.recipient,
            latency_ms,
            error: None,
        }
    }

    /// Source tier: registry card first, then the default population
    /// table, then the envelope's own metadata stamp.
    async fn sender_tier(&self, envelope: &Envelope) -> Option<Tier> {
        if let Some(card) = self.registry.get_by_id(&envelope.sender).await {
            return Some(card.tier);
        }
        default_agent_tier(&envelope.sender)
            .or_else(|| envelope.metadata.as_ref().and_then(|m| m.tier))
    }

    fn tier_check(&self, envelope: &Envelope, src: Tier, tgt: Tier) -> Option<RouterError> {
        if !self.policy.can_route(src, tgt) {
            return Some(RouterError::TierViolation {
                src,
                tgt,
                detail: "routing denied by tier policy".to_string(),
            });
        }
        if self.policy.requires_escalation(src, tgt) && envelope.escalation().is_none() {
            return Some(RouterError::TierViolation {
                src,
                tgt,
                detail: "escalation justification required".to_string(),
            });
        }
        None
    }

    async fn sandbox_check(
        &self,
        envelope: &Envelope,
        recipient_card: &AgentCard,
    ) -> Option<RouterError> {
        let sender_sandbox = match self.registry.get_by_id(&envelope.sender).await {
            Some(card) => card.sandbox_id,
            None => envelope.metadata.as_ref().and_then(|m| m.sandbox_id.clone()),
        };
        let sandbox = sender_sandbox?;
        if recipient_card.sandbox_id.as_deref() == Some(sandbox.as_str()) {
            return None;
        }
        let allowed = self
            .sandbox_allow
            .read()
            .await
            .get(&sandbox)
            .map(|set| set.contains(&recipient_card.id))
            .unwrap_or(false);
        if allowed {
            None
        } else {
            Some(RouterError::SandboxViolation {
                sender: envelope.sender.clone(),
                recipient: recipient_card.id.clone(),
            })
        }
    }

    /// Invoke every handler registered for `agent_id` over a snapshot of
    /// the table. Returns the number of handlers invoked.
    async fn dispatch(&self, agent_id: &str, envelope: &Envelope) -> usize {
        let snapshot: Vec<ReceiveHandler> = self
            .handlers
            .read()
            .await
            .get(agent_id)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        for handler in &snapshot {
            handler(envelope.clone()).await;
        }
        snapshot.len()
    }

    fn path_for(card: &AgentCard) -> RoutePath {
        if card.origin == CardOrigin::Remote {
            RoutePath::Remote
        } else {
            RoutePath::Local
        }
    }

    async fn fail(
        &self,
        envelope: &Envelope,
        target: &str,
        error: RouterError,
        start: Instant,
    ) -> RoutingResult {
        log::warn!("router: {} (envelope {})", error, envelope.id);
        self.sink
            .emit(FabricEvent::RoutingFailed {
                envelope_id: Some(envelope.id.clone()),
                sender: Some(envelope.sender.clone()),
                recipient: Some(target.to_string()),
                kind: error.kind().to_string(),
                detail: error.to_string(),
            })
            .await;
        RoutingResult {
            delivered: false,
            path: if envelope.is_broadcast() {
                RoutePath::Broadcast
            } else {
                RoutePath::Local
            },
            target_id: target.to_string(),
            latency_ms: start.elapsed().as_millis() as u64,
            error: Some(error),
        }
    }
}
