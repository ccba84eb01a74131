//! Agent registry: cards, lookup, and local↔remote discovery merge.
//!
//! The registry is the single owner of [`AgentCard`]s. Every other
//! component consults it by handle: the router resolves recipients and
//! tiers here, the swarm coordinator recruits by capability here, and the
//! discovery layer feeds peer cards in through [`AgentRegistry::merge_remote_card`].
//!
//! # Revision law
//!
//! Registering an id that already exists stores a card whose revision is
//! `max(existing, new) + 1`, so stored revisions for any id form a
//! strictly increasing sequence regardless of how stale the incoming card
//! was.
//!
//! # Discovery
//!
//! Peer discovery is a consumed interface. Hand the registry an
//! implementation of [`Discovery`] and call
//! [`discover_remote_cards`](AgentRegistry::discover_remote_cards): local
//! cards are announced under [`CARD_TOPIC`] and every peer card learned is
//! merged with `origin = remote`.

use crate::orrery::tier::Tier;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Well-known discovery topic for card announcement and ingest.
pub const CARD_TOPIC: &str = "orrery/cards/v1";

/// Protocol version advertised by locally built cards.
pub const PROTOCOL_VERSION: &str = "1.0";

/// A named unit of functionality an agent advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    pub tags: Vec<String>,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            description: String::new(),
            input_schema: None,
            output_schema: None,
            tags: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Transport endpoint kind, ordered by preference in the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointKind {
    Local,
    RemoteStream,
    Websocket,
}

/// A transport descriptor in a card's endpoint list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub kind: EndpointKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Endpoint {
    pub fn local() -> Self {
        Self {
            kind: EndpointKind::Local,
            address: None,
        }
    }

    pub fn remote_stream(address: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::RemoteStream,
            address: Some(address.into()),
        }
    }

    pub fn websocket(address: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Websocket,
            address: Some(address.into()),
        }
    }
}

/// Where a card was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardOrigin {
    Local,
    Remote,
}

/// The public descriptor of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub tier: Tier,
    /// Protocol versions this agent speaks, newest first.
    pub protocols: Vec<String>,
    pub endpoints: Vec<Endpoint>,
    pub capabilities: Vec<Capability>,
    pub revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub origin: CardOrigin,
    /// Wall-clock milliseconds of the last registry touch.
    pub last_seen_at: i64,
}

impl AgentCard {
    /// A minimal local card with a single local endpoint.
    pub fn new(id: impl Into<String>, name: impl Into<String>, tier: Tier) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "0.1.0".to_string(),
            description: String::new(),
            tier,
            protocols: vec![PROTOCOL_VERSION.to_string()],
            endpoints: vec![Endpoint::local()],
            capabilities: Vec::new(),
            revision: 0,
            sandbox_id: None,
            origin: CardOrigin::Local,
            last_seen_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Replace the default endpoint list entirely.
    pub fn with_endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_sandbox(mut self, sandbox_id: impl Into<String>) -> Self {
        self.sandbox_id = Some(sandbox_id.into());
        self
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_origin(mut self, origin: CardOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Whether the card advertises a capability with this name.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }
}

/// Errors raised by registry operations.
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// The card failed structural validation; the message names the field.
    InvalidCard(String),
    /// No card stored under the given id.
    NotFound(String),
    /// A discovery round failed in the underlying provider.
    DiscoveryFailed(String),
}

impl RegistryError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::InvalidCard(_) => "schema-mismatch",
            RegistryError::NotFound(_) => "not-found",
            RegistryError::DiscoveryFailed(_) => "delivery-failed",
        }
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::InvalidCard(msg) => write!(f, "Invalid agent card: {}", msg),
            RegistryError::NotFound(id) => write!(f, "Agent not found: {}", id),
            RegistryError::DiscoveryFailed(msg) => write!(f, "Discovery failed: {}", msg),
        }
    }
}

impl Error for RegistryError {}

/// Consumed peer-discovery interface (DHT, gossip, mDNS; the registry
/// does not care). Implementations announce local cards under a topic and
/// return the cards peers announced under the same topic.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn announce(
        &self,
        topic: &str,
        card: &AgentCard,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn discover(
        &self,
        topic: &str,
    ) -> Result<Vec<AgentCard>, Box<dyn Error + Send + Sync>>;

    async fn destroy(&self);
}

#[derive(Default)]
struct RegistryInner {
    cards: HashMap<String, AgentCard>,
    /// Registration order of ids, for deterministic multi-card lookups.
    order: Vec<String>,
}

/// Thread-safe store of agent cards with capability and tier lookup.
///
/// Lookups that can return more than one card (`find_by_capability`,
/// `find_by_tier`, `list_all`) preserve registration order, which is what
/// the router's tie-breaking relies on.
pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
    discovery: RwLock<Option<Arc<dyn Discovery>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            discovery: RwLock::new(None),
        }
    }

    fn validate(card: &AgentCard) -> Result<(), RegistryError> {
        if card.id.is_empty() {
            return Err(RegistryError::InvalidCard("id must not be empty".into()));
        }
        if card.name.is_empty() {
            return Err(RegistryError::InvalidCard("name must not be empty".into()));
        }
        if card.protocols.is_empty() {
            return Err(RegistryError::InvalidCard(
                "protocols must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Store a card. New ids keep the supplied revision; existing ids are
    /// overwritten with `revision = max(existing, new) + 1` and keep their
    /// stored origin. Returns the card as stored.
    pub async fn register(&self, card: AgentCard) -> Result<AgentCard, RegistryError> {
        self.store(card, None).await
    }

    /// Same as [`register`](Self::register) but forces `origin = remote`.
    /// This is the only path by which remote cards enter the registry.
    pub async fn merge_remote_card(&self, card: AgentCard) -> Result<AgentCard, RegistryError> {
        self.store(card, Some(CardOrigin::Remote)).await
    }

    async fn store(
        &self,
        mut card: AgentCard,
        force_origin: Option<CardOrigin>,
    ) -> Result<AgentCard, RegistryError> {
        Self::validate(&card)?;
        if let Some(origin) = force_origin {
            card.origin = origin;
        }
        card.last_seen_at = Utc::now().timestamp_millis();

        let mut inner = self.inner.write().await;
        match inner.cards.get(&card.id) {
            Some(existing) => {
                card.revision = existing.revision.max(card.revision) + 1;
                if force_origin.is_none() {
                    card.origin = existing.origin;
                }
            }
            None => {
                inner.order.push(card.id.clone());
            }
        }
        log::debug!(
            "registry: stored card {} (tier {}, revision {})",
            card.id,
            card.tier,
            card.revision
        );
        inner.cards.insert(card.id.clone(), card.clone());
        Ok(card)
    }

    /// Remove a card. Returns whether anything was removed.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.cards.remove(id).is_some();
        if removed {
            inner.order.retain(|entry| entry != id);
        }
        removed
    }

    pub async fn get_by_id(&self, id: &str) -> Option<AgentCard> {
        self.inner.read().await.cards.get(id).cloned()
    }

    /// All cards advertising a capability with this name, in registration
    /// order.
    pub async fn find_by_capability(&self, name: &str) -> Vec<AgentCard> {
        self.ordered(|card| card.has_capability(name)).await
    }

    /// All cards at the given tier, in registration order.
    pub async fn find_by_tier(&self, tier: Tier) -> Vec<AgentCard> {
        self.ordered(|card| card.tier == tier).await
    }

    /// Every stored card, in registration order.
    pub async fn list_all(&self) -> Vec<AgentCard> {
        self.ordered(|_| true).await
    }

    pub async fn local_cards(&self) -> Vec<AgentCard> {
        self.ordered(|card| card.origin == CardOrigin::Local).await
    }

    pub async fn remote_cards(&self) -> Vec<AgentCard> {
        self.ordered(|card| card.origin == CardOrigin::Remote).await
    }

    async fn ordered<F>(&self, keep: F) -> Vec<AgentCard>
    where
        F: Fn(&AgentCard) -> bool,
    {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.cards.get(id))
            .filter(|card| keep(card))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.cards.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.cards.is_empty()
    }

    /// Refresh a card's `last_seen_at` without touching its revision.
    pub async fn touch(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.cards.get_mut(id) {
            Some(card) => {
                card.last_seen_at = Utc::now().timestamp_millis();
                true
            }
            None => false,
        }
    }

    /// JSON form of a card, round-trippable via
    /// [`deserialize_card`](Self::deserialize_card).
    pub fn serialize_card(card: &AgentCard) -> Result<String, RegistryError> {
        serde_json::to_string(card).map_err(|e| RegistryError::InvalidCard(e.to_string()))
    }

    pub fn deserialize_card(raw: &str) -> Result<AgentCard, RegistryError> {
        serde_json::from_str(raw).map_err(|e| RegistryError::InvalidCard(e.to_string()))
    }

    /// Attach a discovery provider. Subsequent
    /// [`discover_remote_cards`](Self::discover_remote_cards) calls go
    /// through it.
    pub async fn enable_discovery(&self, discovery: Arc<dyn Discovery>) {
        *self.discovery.write().await = Some(discovery);
    }

    /// Detach and destroy the current discovery provider, if any.
    pub async fn disable_discovery(&self) {
        if let Some(discovery) = self.discovery.write().await.take() {
            discovery.destroy().await;
        }
    }

    /// Announce local cards under [`CARD_TOPIC`], ingest peer cards via
    /// [`merge_remote_card`](Self::merge_remote_card), and return how many
    /// peers were learned. Cards echoing back ids we already hold locally
    /// are skipped.
    pub async fn discover_remote_cards(&self) -> Result<usize, RegistryError> {
        let discovery = match self.discovery.read().await.clone() {
            Some(discovery) => discovery,
            None => return Ok(0),
        };

        for card in self.local_cards().await {
            discovery
                .announce(CARD_TOPIC, &card)
                .await
                .map_err(|e| RegistryError::DiscoveryFailed(e.to_string()))?;
        }

        let peers = discovery
            .discover(CARD_TOPIC)
            .await
            .map_err(|e| RegistryError::DiscoveryFailed(e.to_string()))?;

        let local_ids: Vec<String> = self
            .local_cards()
            .await
            .into_iter()
            .map(|card| card.id)
            .collect();

        let mut learned = 0;
        for card in peers {
            if local_ids.iter().any(|id| *id == card.id) {
                continue;
            }
            self.merge_remote_card(card).await?;
            learned += 1;
        }
        log::debug!("registry: discovery round learned {} peer card(s)", learned);
        Ok(learned)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
