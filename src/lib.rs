// src/lib.rs

//! orrery is a decentralized agent-to-agent coordination fabric.
//!
//! A fixed population of cooperating agents exchanges structured
//! envelopes through a router that enforces tier and sandbox policy,
//! with persistent ordered channels, task negotiation, swarm
//! coordination, and vector-clock CRDT propagation layered on top. See
//! the individual modules for the full picture; [`router`] is the place
//! to start.

// Import the top-level `orrery` module.
pub mod orrery;

// Re-export the submodules at the crate root so callers write
// `orrery::router::Router` rather than `orrery::orrery::router::Router`.
pub use crate::orrery::{
    bridge, channel, crdt_sync, envelope, negotiation, observability, registry, router, swarm,
    tier,
};

// Re-exporting key items for easier external access.
pub use crate::orrery::envelope::{Envelope, EnvelopeFactory, EnvelopeType};
pub use crate::orrery::registry::{AgentCard, AgentRegistry, Capability};
pub use crate::orrery::router::{Router, RoutingResult};
pub use crate::orrery::tier::{Tier, TierPolicy};
