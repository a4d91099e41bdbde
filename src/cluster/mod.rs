//! Cluster membership and key ownership
//!
//! A consistent hash ring maps room IDs to instances; the membership manager
//! keeps the ring in sync with heartbeat-driven liveness state shared through
//! the coordination store.

pub mod hash;
pub mod membership;

pub use hash::{Blake3Hasher, ConsistentHashRing, RingHasher, Sha3Hasher};
pub use membership::{ClusterEvent, InstanceManager};
