//! Shared coordination store boundary
//!
//! The control plane keeps all cross-instance state (membership, pool sets,
//! room bindings, locks) in a key-value store with hashes, sets, TTL,
//! pub/sub, and atomic multi-key operations. This module defines that
//! boundary as a trait; `MemoryStore` is the in-process reference
//! implementation used by tests and single-node deployments.

pub mod memory;

pub use memory::MemoryStore;

use crate::core::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::broadcast;

/// Result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-value coordination store with sets, hashes, TTL, pub/sub, and atomic
/// multi-key operations.
///
/// Every mutation that must be atomic across instances (lock acquire and
/// release, pool acquire and release) is a dedicated method here, never a
/// read-then-write sequence composed by the caller.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Get a string value
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a string value
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Delete a key, returning whether it existed
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Atomic set-if-absent with expiry, in one round trip.
    ///
    /// Returns true when the key was absent and is now set. This is the lock
    /// acquisition primitive.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomic compare-value-then-delete.
    ///
    /// Returns true when the stored value matched and the key was deleted.
    /// This is the lock release primitive; a stale token never deletes a
    /// lock reacquired by someone else.
    async fn del_if_match(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// Set one field of a hash
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Read the full contents of a hash
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Delete one field of a hash, returning whether it existed
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Add a member to a set, returning whether it was newly added
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member from a set, returning whether it was present
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Read all members of a set
    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>>;

    /// Check set membership
    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Atomically acquire a resource ID: pop one member of `idle_key` into
    /// `used_key`, or mint a fresh ID from `counter_key` (skipping values
    /// already in `used_key`, which handles counter reuse after a crash).
    async fn pool_acquire(
        &self,
        idle_key: &str,
        used_key: &str,
        counter_key: &str,
    ) -> StoreResult<String>;

    /// Atomically release a resource ID: move it from `used_key` to
    /// `idle_key`. Returns false (no-op) when the ID is not in `used_key`.
    async fn pool_release(&self, used_key: &str, idle_key: &str, id: &str) -> StoreResult<bool>;

    /// Publish a payload on a pub/sub topic
    async fn publish(&self, topic: &str, payload: &str) -> StoreResult<()>;

    /// Subscribe to a pub/sub topic.
    ///
    /// Delivery is at-least-once with no cross-instance ordering guarantee;
    /// subscribers must reconcile idempotently.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<String>;
}
