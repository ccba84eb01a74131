//! Tier hierarchy and routing policy.
//!
//! Every agent in the fabric sits at one of four tiers: `L0` is the
//! orchestrator, `L1` agents are strategic, `L2` operational, `L3`
//! specialist. The tier pair (source, target) decides whether the router
//! will carry an envelope at all, and whether the sender must attach an
//! escalation justification first.
//!
//! The default rule table ships with the crate and can be overridden per
//! row at construction:
//!
//! ```rust
//! use orrery::tier::{Tier, TierPolicy, TierRule};
//!
//! // Default rules: L1 may only reach L0 and L1.
//! let policy = TierPolicy::default();
//! assert!(!policy.can_route(Tier::L1, Tier::L2));
//!
//! // Deployment that wants L1 downward delegation overrides that row.
//! let policy = TierPolicy::default().with_rule(
//!     Tier::L1,
//!     TierRule::new(vec![Tier::L0, Tier::L1, Tier::L2, Tier::L3]),
//! );
//! assert!(policy.can_route(Tier::L1, Tier::L3));
//! ```

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// An agent's place in the L0–L3 hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Orchestrator. May address any tier.
    L0,
    /// Strategic agents reporting to the orchestrator.
    L1,
    /// Operational agents. Reaching upward requires escalation.
    L2,
    /// Specialist agents. May never address L0/L1 directly.
    L3,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::L0 => write!(f, "L0"),
            Tier::L1 => write!(f, "L1"),
            Tier::L2 => write!(f, "L2"),
            Tier::L3 => write!(f, "L3"),
        }
    }
}

/// Routing rule for a single source tier.
#[derive(Debug, Clone)]
pub struct TierRule {
    /// Tiers this source may address.
    pub allowed: Vec<Tier>,
    /// Subset of `allowed` that additionally requires an escalation
    /// justification on the envelope.
    pub escalation: Vec<Tier>,
}

impl TierRule {
    /// Rule allowing the given targets with no escalation requirement.
    pub fn new(allowed: Vec<Tier>) -> Self {
        Self {
            allowed,
            escalation: Vec::new(),
        }
    }

    /// Mark a subset of the allowed targets as escalation-gated.
    pub fn with_escalation(mut self, escalation: Vec<Tier>) -> Self {
        self.escalation = escalation;
        self
    }
}

/// The tier routing policy consulted by the router on every send.
///
/// Default rules:
///
/// | src | allowed targets     | escalation    |
/// |-----|---------------------|---------------|
/// | L0  | L0, L1, L2, L3      | none          |
/// | L1  | L0, L1              | none          |
/// | L2  | L0, L1, L2          | to L0 and L1  |
/// | L3  | L2, L3              | none (L3 to L0/L1 is denied outright) |
#[derive(Debug, Clone)]
pub struct TierPolicy {
    rules: HashMap<Tier, TierRule>,
}

impl TierPolicy {
    /// Policy with the default rule table.
    pub fn new() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            Tier::L0,
            TierRule::new(vec![Tier::L0, Tier::L1, Tier::L2, Tier::L3]),
        );
        rules.insert(Tier::L1, TierRule::new(vec![Tier::L0, Tier::L1]));
        rules.insert(
            Tier::L2,
            TierRule::new(vec![Tier::L0, Tier::L1, Tier::L2])
                .with_escalation(vec![Tier::L0, Tier::L1]),
        );
        rules.insert(Tier::L3, TierRule::new(vec![Tier::L2, Tier::L3]));
        Self { rules }
    }

    /// Replace the rule for one source tier, keeping the rest of the table.
    pub fn with_rule(mut self, src: Tier, rule: TierRule) -> Self {
        self.rules.insert(src, rule);
        self
    }

    /// Whether the rule for `src` lists `tgt` as an allowed target.
    pub fn can_route(&self, src: Tier, tgt: Tier) -> bool {
        self.rules
            .get(&src)
            .map(|rule| rule.allowed.contains(&tgt))
            .unwrap_or(false)
    }

    /// Whether a send from `src` to `tgt` must carry an escalation
    /// justification. Only meaningful when `can_route` already holds.
    pub fn requires_escalation(&self, src: Tier, tgt: Tier) -> bool {
        self.rules
            .get(&src)
            .map(|rule| rule.escalation.contains(&tgt))
            .unwrap_or(false)
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// The well-known agent population and its fixed tier assignment.
    static ref DEFAULT_AGENT_TIERS: HashMap<&'static str, Tier> = {
        let mut m = HashMap::new();
        m.insert("sun", Tier::L0);
        m.insert("mercury", Tier::L1);
        m.insert("earth", Tier::L1);
        m.insert("jupiter", Tier::L1);
        m.insert("venus", Tier::L2);
        m.insert("mars", Tier::L2);
        m.insert("pluto", Tier::L2);
        m.insert("saturn", Tier::L2);
        m.insert("titan", Tier::L2);
        m.insert("enceladus", Tier::L3);
        m.insert("ganymede", Tier::L3);
        m.insert("neptune", Tier::L3);
        m.insert("charon", Tier::L3);
        m.insert("uranus", Tier::L3);
        m.insert("europa", Tier::L3);
        m.insert("mimas", Tier::L3);
        m.insert("io", Tier::L3);
        m.insert("triton", Tier::L3);
        m.insert("callisto", Tier::L3);
        m.insert("atlas", Tier::L3);
        m.insert("andromeda", Tier::L3);
        m
    };
}

/// Tier of a well-known agent id, if it is part of the default population.
pub fn default_agent_tier(agent_id: &str) -> Option<Tier> {
    DEFAULT_AGENT_TIERS.get(agent_id).copied()
}

/// Snapshot of the full default agent → tier assignment.
pub fn default_tier_map() -> HashMap<String, Tier> {
    DEFAULT_AGENT_TIERS
        .iter()
        .map(|(id, tier)| (id.to_string(), *tier))
        .collect()
}
