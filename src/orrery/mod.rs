// src/orrery/mod.rs

pub mod bridge;
pub mod channel;
pub mod crdt_sync;
pub mod envelope;
pub mod negotiation;
pub mod observability;
pub mod registry;
pub mod router;
pub mod swarm;
pub mod tier;

// Export the router directly so callers can reach it as orrery::Router
// instead of orrery::router::Router.
pub use router::Router;
