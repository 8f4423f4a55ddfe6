//! Peer mesh: discovery, liveness, and leader election.
//!
//! Discovery is two-path. The shared filesystem gives durable rendezvous
//! (`endpoint.json` files), UDP multicast gives fast liveness and state
//! propagation, and HTTP `/status` polls fill in hardware detail. The
//! [`registry::PeerRegistry`] merges all three into one authoritative
//! view that the election and dispatch read.

pub mod discovery;
pub mod poller;
pub mod registry;
pub mod udp;

pub use registry::PeerRegistry;
