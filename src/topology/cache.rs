//! Local room-state cache
//!
//! Hot-path reads (tier, binding names) come out of expiring local entries
//! instead of hitting the coordination store on every event. Entries expire
//! after a configured TTL and are invalidated explicitly before any
//! reclassification, so decisions are always taken on fresh counts.
//! Malformed store values degrade to safe defaults rather than erroring.

use crate::core::config::TierConfig;
use crate::store::{CoordinationStore, StoreResult};
use crate::topology::tier::RoomTier;
use crate::topology::{Keys, RoomId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Broker resource names currently recorded for a room.
///
/// Queue names are kept sorted so shard indices are stable across
/// instances reading the same set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomBindings {
    /// Exchanges the room publishes through (normally exactly one)
    pub exchanges: Vec<String>,
    /// Queue shards fanning the room's messages out, sorted by name
    pub queues: Vec<String>,
}

impl RoomBindings {
    /// Whether any broker resources are recorded at all
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty()
    }
}

struct Cached<V> {
    value: V,
    fetched_at: Instant,
}

impl<V: Clone> Cached<V> {
    fn fresh(value: V) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
        }
    }

    fn live(&self, ttl: Duration) -> Option<V> {
        (self.fetched_at.elapsed() < ttl).then(|| self.value.clone())
    }
}

/// TTL'd local view of per-room store state
pub struct RoomCache {
    store: Arc<dyn CoordinationStore>,
    keys: Keys,
    tiers_cfg: TierConfig,
    room_ttl: Duration,
    tiers: DashMap<RoomId, Cached<RoomTier>>,
    bindings: DashMap<RoomId, Cached<RoomBindings>>,
}

impl RoomCache {
    /// Create a cache over `store` with the given entry TTL
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: Keys,
        tiers_cfg: TierConfig,
        room_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            tiers_cfg,
            room_ttl,
            tiers: DashMap::new(),
            bindings: DashMap::new(),
        }
    }

    /// Current viewer count from the store; absent or malformed reads as 0
    pub async fn viewer_count(&self, room: RoomId) -> StoreResult<u64> {
        let raw = self.store.get(&self.keys.room_viewers(room)).await?;
        Ok(match raw {
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!(room, value = %v, "Malformed viewer count, treating as 0");
                0
            }),
            None => 0,
        })
    }

    /// Tier of the room, classified from the viewer count and cached
    pub async fn tier(&self, room: RoomId) -> StoreResult<RoomTier> {
        if let Some(entry) = self.tiers.get(&room) {
            if let Some(tier) = entry.live(self.room_ttl) {
                return Ok(tier);
            }
        }

        let viewers = self.viewer_count(room).await?;
        let tier = RoomTier::classify(viewers, &self.tiers_cfg);
        self.tiers.insert(room, Cached::fresh(tier));
        Ok(tier)
    }

    /// Tier last published to the store, if any.
    ///
    /// Unlike [`tier`](Self::tier) this reflects what the cluster has
    /// already acted on, not the live viewer count. Unknown tier names
    /// read as absent.
    pub async fn published_tier(&self, room: RoomId) -> StoreResult<Option<RoomTier>> {
        let raw = self.store.get(&self.keys.room_tier(room)).await?;
        Ok(raw.and_then(|v| {
            v.parse()
                .map_err(|_| warn!(room, value = %v, "Unknown tier name in store"))
                .ok()
        }))
    }

    /// Exchange and queue names recorded for the room, cached
    pub async fn bindings(&self, room: RoomId) -> StoreResult<RoomBindings> {
        if let Some(entry) = self.bindings.get(&room) {
            if let Some(bindings) = entry.live(self.room_ttl) {
                return Ok(bindings);
            }
        }

        let mut exchanges: Vec<String> = self
            .store
            .smembers(&self.keys.room_exchanges(room))
            .await?
            .into_iter()
            .collect();
        let mut queues: Vec<String> = self
            .store
            .smembers(&self.keys.room_queues(room))
            .await?
            .into_iter()
            .collect();
        exchanges.sort();
        queues.sort();

        let bindings = RoomBindings { exchanges, queues };
        self.bindings.insert(room, Cached::fresh(bindings.clone()));
        Ok(bindings)
    }

    /// Drop all local entries for the room, forcing fresh reads
    pub fn invalidate(&self, room: RoomId) {
        self.tiers.remove(&room);
        self.bindings.remove(&room);
    }

    /// Record a freshly published tier locally
    pub fn put_tier(&self, room: RoomId, tier: RoomTier) {
        self.tiers.insert(room, Cached::fresh(tier));
    }

    /// Record freshly written binding names locally
    pub fn put_bindings(&self, room: RoomId, bindings: RoomBindings) {
        self.bindings.insert(room, Cached::fresh(bindings));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache_over(store: Arc<MemoryStore>) -> RoomCache {
        RoomCache::new(
            store,
            Keys::new("rc"),
            TierConfig::default(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_malformed_viewer_count_reads_zero() {
        let store = Arc::new(MemoryStore::new());
        store.set("rc:room:1:viewers", "not-a-number").await.unwrap();
        let cache = cache_over(store);
        assert_eq!(cache.viewer_count(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tier_cached_until_invalidated() {
        let store = Arc::new(MemoryStore::new());
        store.set("rc:room:1:viewers", "5000").await.unwrap();
        let cache = cache_over(store.clone());

        assert_eq!(cache.tier(1).await.unwrap(), RoomTier::Hot);

        // Stale entry keeps serving until the cache is told otherwise
        store.set("rc:room:1:viewers", "5").await.unwrap();
        assert_eq!(cache.tier(1).await.unwrap(), RoomTier::Hot);

        cache.invalidate(1);
        assert_eq!(cache.tier(1).await.unwrap(), RoomTier::Cold);
    }

    #[tokio::test]
    async fn test_bindings_sorted_and_cached() {
        let store = Arc::new(MemoryStore::new());
        store.sadd("rc:room:2:queue", "danmaku.q.dedicated.3").await.unwrap();
        store.sadd("rc:room:2:queue", "danmaku.q.dedicated.1").await.unwrap();
        store.sadd("rc:room:2:exchange", "danmaku.ex.dedicated.1").await.unwrap();
        let cache = cache_over(store.clone());

        let bindings = cache.bindings(2).await.unwrap();
        assert_eq!(
            bindings.queues,
            vec!["danmaku.q.dedicated.1", "danmaku.q.dedicated.3"]
        );
        assert_eq!(bindings.exchanges, vec!["danmaku.ex.dedicated.1"]);

        store.srem("rc:room:2:queue", "danmaku.q.dedicated.1").await.unwrap();
        assert_eq!(cache.bindings(2).await.unwrap(), bindings);
    }

    #[tokio::test]
    async fn test_unknown_published_tier_reads_absent() {
        let store = Arc::new(MemoryStore::new());
        store.set("rc:room:3:type", "LUKEWARM").await.unwrap();
        let cache = cache_over(store);
        assert_eq!(cache.published_tier(3).await.unwrap(), None);
    }
}
