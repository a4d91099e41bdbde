//! In-process coordination store
//!
//! `MemoryStore` backs tests and single-node deployments. A single mutex
//! guards all keyspaces so that the pool and lock operations get the same
//! atomicity a server-side script gives a networked store. Pub/sub rides on
//! `tokio::sync::broadcast` channels, one per topic.

use crate::core::error::StoreError;
use crate::store::{CoordinationStore, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const TOPIC_BUFFER: usize = 256;

/// A string value with optional expiry
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    counters: HashMap<String, u64>,
}

/// In-memory implementation of [`CoordinationStore`]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            topics: DashMap::new(),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        match inner.strings.get(key) {
            Some(entry) if entry.live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.strings.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.lock().strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let had_string = inner.strings.remove(key).map_or(false, |e| e.live());
        let had_hash = inner.hashes.remove(key).is_some();
        let had_set = inner.sets.remove(key).is_some();
        Ok(had_string || had_hash || had_set)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        if inner.strings.get(key).is_some_and(|e| e.live()) {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del_if_match(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        match inner.strings.get(key) {
            Some(entry) if entry.live() && entry.value == value => {
                inner.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        Ok(inner
            .hashes
            .get_mut(key)
            .map_or(false, |h| h.remove(field).is_some()))
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        Ok(inner.sets.get_mut(key).map_or(false, |s| s.remove(member)))
    }

    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>> {
        Ok(self.inner.lock().sets.get(key).cloned().unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .map_or(false, |s| s.contains(member)))
    }

    async fn pool_acquire(
        &self,
        idle_key: &str,
        used_key: &str,
        counter_key: &str,
    ) -> StoreResult<String> {
        let mut inner = self.inner.lock();

        // SPOP-equivalent: any idle member will do
        if let Some(id) = inner
            .sets
            .get(idle_key)
            .and_then(|s| s.iter().next().cloned())
        {
            inner.sets.get_mut(idle_key).map(|s| s.remove(&id));
            inner
                .sets
                .entry(used_key.to_string())
                .or_default()
                .insert(id.clone());
            return Ok(id);
        }

        // Mint a new ID, skipping values already in use (counter may lag
        // the used set after a crash).
        let mut counter = inner.counters.get(counter_key).copied().unwrap_or(0);
        loop {
            counter += 1;
            let candidate = counter.to_string();
            let in_use = inner
                .sets
                .get(used_key)
                .map_or(false, |s| s.contains(&candidate));
            if !in_use {
                inner.counters.insert(counter_key.to_string(), counter);
                inner
                    .sets
                    .entry(used_key.to_string())
                    .or_default()
                    .insert(candidate.clone());
                return Ok(candidate);
            }
        }
    }

    async fn pool_release(&self, used_key: &str, idle_key: &str, id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let removed = inner.sets.get_mut(used_key).map_or(false, |s| s.remove(id));
        if removed {
            inner
                .sets
                .entry(idle_key.to_string())
                .or_default()
                .insert(id.to_string());
        }
        Ok(removed)
    }

    async fn publish(&self, topic: &str, payload: &str) -> StoreResult<()> {
        // A send error only means nobody is subscribed yet
        let _ = self.sender(topic).send(payload.to_string());
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.sender(topic).subscribe()
    }
}

// Keep the error type exercised even though the memory backend is infallible;
// a networked backend maps transport failures into these variants.
impl MemoryStore {
    /// Map a hypothetical transport failure (used by fault-injection tests)
    #[doc(hidden)]
    pub fn transport_error(reason: &str) -> StoreError {
        StoreError::Connection(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_roundtrip() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.del("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_px_excludes_second_writer() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.set_nx_px("lock", "a", ttl).await.unwrap());
        assert!(!store.set_nx_px("lock", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_key_reads_as_absent() {
        let store = MemoryStore::new();
        store
            .set_nx_px("lock", "a", Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("lock").await.unwrap(), None);
        assert!(store
            .set_nx_px("lock", "b", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_del_if_match_requires_current_value() {
        let store = MemoryStore::new();
        store
            .set_nx_px("lock", "token", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!store.del_if_match("lock", "stale").await.unwrap());
        assert!(store.del_if_match("lock", "token").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let store = MemoryStore::new();
        store.hset("h", "a", "1").await.unwrap();
        store.hset("h", "b", "2").await.unwrap();
        let all = store.hgetall("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("h", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_pool_acquire_prefers_idle_then_mints() {
        let store = MemoryStore::new();
        store.sadd("idle", "7").await.unwrap();

        let id = store.pool_acquire("idle", "used", "ctr").await.unwrap();
        assert_eq!(id, "7");
        assert!(store.sismember("used", "7").await.unwrap());

        let id = store.pool_acquire("idle", "used", "ctr").await.unwrap();
        assert_eq!(id, "1");
    }

    #[tokio::test]
    async fn test_pool_mint_skips_used_ids() {
        let store = MemoryStore::new();
        // Simulate a crash that left IDs in used while the counter reset
        store.sadd("used", "1").await.unwrap();
        store.sadd("used", "2").await.unwrap();

        let id = store.pool_acquire("idle", "used", "ctr").await.unwrap();
        assert_eq!(id, "3");
    }

    #[tokio::test]
    async fn test_pool_release_is_noop_for_unknown_id() {
        let store = MemoryStore::new();
        store.sadd("used", "4").await.unwrap();
        assert!(store.pool_release("used", "idle", "4").await.unwrap());
        assert!(!store.pool_release("used", "idle", "4").await.unwrap());
        assert!(store.sismember("idle", "4").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("topic");
        store.publish("topic", "hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}
