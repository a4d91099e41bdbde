//! Room topology reconciliation
//!
//! Owns the broker-side shape of every room: which exchange it publishes
//! through and which queue shards fan its messages out. Reconciliation runs
//! on room-status events and on a periodic sweep, debounced per room and
//! serialized under a per-room distributed lock so concurrent instances
//! never fight over the same room's resources.
//!
//! Cold rooms all ride one well-known topic exchange and one well-known
//! queue, bound once with a wildcard key. Hotter rooms get a dedicated
//! direct exchange plus tier-many queue shards whose names come from the
//! resource ID pool and return to it on reclassification.

use crate::broker::{BrokerAdmin, ExchangeKind, QueueArgs};
use crate::coord::lock::DistributedLock;
use crate::coord::pool::{ResourceIdPool, ResourceKind, SharingClass};
use crate::core::config::{Config, ShardingConfig, TierConfig, TopologyConfig};
use crate::core::error::Result;
use crate::store::CoordinationStore;
use crate::system::metrics;
use crate::topology::cache::{RoomBindings, RoomCache};
use crate::topology::tier::RoomTier;
use crate::topology::{Keys, RoomId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Shared topic exchange every cold room publishes through
pub const SHARED_EXCHANGE: &str = "danmaku.ex.shared";

/// Shared queue receiving all cold-room traffic
pub const SHARED_QUEUE: &str = "danmaku.q.shared";

/// Wildcard binding between the shared queue and shared exchange
pub const SHARED_BINDING_KEY: &str = "room.#";

/// Routing key carrying one room's messages to one queue shard
pub fn routing_key(room: RoomId, shard: usize) -> String {
    format!("room.{}.{}", room, shard)
}

fn dedicated_name(kind: ResourceKind, id: &str) -> String {
    match kind {
        ResourceKind::Exchange => format!("danmaku.ex.dedicated.{}", id),
        ResourceKind::Queue => format!("danmaku.q.dedicated.{}", id),
    }
}

/// Pool ID embedded in a dedicated resource name, if it is one
fn dedicated_id(kind: ResourceKind, name: &str) -> Option<&str> {
    let prefix = match kind {
        ResourceKind::Exchange => "danmaku.ex.dedicated.",
        ResourceKind::Queue => "danmaku.q.dedicated.",
    };
    name.strip_prefix(prefix).filter(|id| !id.is_empty())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Reconciles each room's broker topology with its traffic tier
pub struct TopologyManager {
    store: Arc<dyn CoordinationStore>,
    broker: Arc<dyn BrokerAdmin>,
    pool: ResourceIdPool,
    lock: DistributedLock,
    cache: Arc<RoomCache>,
    keys: Keys,
    tiers_cfg: TierConfig,
    sharding: ShardingConfig,
    timing: TopologyConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TopologyManager {
    /// Build a manager sharing `cache` with the consumer coordinator
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        broker: Arc<dyn BrokerAdmin>,
        cache: Arc<RoomCache>,
        config: &Config,
    ) -> Self {
        let keys = Keys::new(config.cluster.key_prefix.clone());
        let pool = ResourceIdPool::new(store.clone(), keys.pool_prefix());
        let lock = DistributedLock::new(store.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            store,
            broker,
            pool,
            lock,
            cache,
            keys,
            tiers_cfg: config.tiers.clone(),
            sharding: config.sharding.clone(),
            timing: config.topology.clone(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the periodic room sweep
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.timing.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick so startup isn't a full sweep
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = manager.sweep_once().await {
                            error!(error = %e, "room sweep failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Record a room as active so the sweep keeps watching it
    pub async fn mark_room_active(&self, room: RoomId) -> Result<()> {
        self.store
            .sadd(&self.keys.active_rooms(), &room.to_string())
            .await?;
        Ok(())
    }

    /// React to a room-status event: debounce, lock, reclassify, and reshape
    /// broker resources if the tier moved.
    pub async fn process_room_status(&self, room: RoomId) -> Result<()> {
        let now = now_millis();

        if let Some(last) = self.last_event(room).await? {
            if now.saturating_sub(last) < self.timing.min_change_interval.as_millis() as u64 {
                metrics::topology().debounce_skips.inc();
                // Still drop stale local state so the next pass sees fresh counts
                self.cache.invalidate(room);
                debug!(room, "topology change debounced");
                return Ok(());
            }
        }

        let lock_key = self.keys.room_lock(room);
        let Some(token) = self.lock.try_acquire(&lock_key, self.timing.lock_ttl).await else {
            metrics::topology().lock_contention.inc();
            debug!(room, "another instance holds the room lock");
            return Ok(());
        };

        let result = self.reconcile(room, now).await;
        self.lock.release(&lock_key, &token).await;
        result
    }

    async fn reconcile(&self, room: RoomId, now: u64) -> Result<()> {
        self.cache.invalidate(room);

        let viewers = self.cache.viewer_count(room).await?;
        let new_tier = RoomTier::classify(viewers, &self.tiers_cfg);
        let old_tier = self.cache.published_tier(room).await?;
        let bindings = self.cache.bindings(room).await?;

        if old_tier == Some(new_tier) && !bindings.is_empty() {
            self.cache.put_tier(room, new_tier);
            debug!(room, tier = %new_tier, "tier unchanged, topology kept");
            return Ok(());
        }

        if !bindings.is_empty() {
            self.release_bindings(room, &bindings).await?;
        }

        let new_bindings = self.provision(room, new_tier).await?;

        self.store
            .set(&self.keys.room_tier(room), new_tier.as_str())
            .await?;
        self.store
            .set(&self.keys.room_last_event(room), &now.to_string())
            .await?;
        self.cache.put_tier(room, new_tier);
        self.cache.put_bindings(room, new_bindings);

        self.store
            .publish(&self.keys.topology_topic(), &room.to_string())
            .await?;

        if old_tier != Some(new_tier) {
            metrics::topology().reclassifications.inc();
        }
        info!(
            room,
            viewers,
            old_tier = old_tier.map(|t| t.as_str()).unwrap_or("none"),
            new_tier = %new_tier,
            "room topology reconciled"
        );
        Ok(())
    }

    /// Declare the broker resources for a room at `tier` and record their
    /// names in the store.
    async fn provision(&self, room: RoomId, tier: RoomTier) -> Result<RoomBindings> {
        match tier.sharing_class() {
            SharingClass::Shared => {
                self.ensure_shared_resources().await?;
                self.store
                    .sadd(&self.keys.room_exchanges(room), SHARED_EXCHANGE)
                    .await?;
                self.store
                    .sadd(&self.keys.room_queues(room), SHARED_QUEUE)
                    .await?;
                Ok(RoomBindings {
                    exchanges: vec![SHARED_EXCHANGE.to_string()],
                    queues: vec![SHARED_QUEUE.to_string()],
                })
            }
            SharingClass::Dedicated => {
                let ex_id = self
                    .pool
                    .acquire(ResourceKind::Exchange, SharingClass::Dedicated)
                    .await?;
                let exchange = dedicated_name(ResourceKind::Exchange, &ex_id);
                self.broker
                    .declare_exchange(&exchange, ExchangeKind::Direct)
                    .await?;
                self.store
                    .sadd(&self.keys.room_exchanges(room), &exchange)
                    .await?;

                let shards = tier.shard_count(&self.sharding);
                let mut queues = Vec::with_capacity(shards);
                for _ in 0..shards {
                    let q_id = self
                        .pool
                        .acquire(ResourceKind::Queue, SharingClass::Dedicated)
                        .await?;
                    queues.push(dedicated_name(ResourceKind::Queue, &q_id));
                }
                // Shard index follows sorted name order so every instance
                // derives the same queue-to-routing-key mapping
                queues.sort();

                let args = self.queue_args();
                for (shard, queue) in queues.iter().enumerate() {
                    self.broker.declare_queue(queue, &args).await?;
                    self.broker
                        .bind_queue(queue, &exchange, &routing_key(room, shard))
                        .await?;
                    self.store.sadd(&self.keys.room_queues(room), queue).await?;
                }

                Ok(RoomBindings {
                    exchanges: vec![exchange],
                    queues,
                })
            }
        }
    }

    /// Delete a room's dedicated resources and return their IDs to the pool.
    /// Each name is judged on its own: shared resources outlive any one room
    /// and are left untouched even if the room's recorded tier is garbage.
    async fn release_bindings(&self, room: RoomId, bindings: &RoomBindings) -> Result<()> {
        for queue in &bindings.queues {
            if let Some(id) = dedicated_id(ResourceKind::Queue, queue) {
                self.broker.delete_queue(queue).await?;
                self.pool
                    .release(ResourceKind::Queue, SharingClass::Dedicated, id)
                    .await?;
            } else if queue != SHARED_QUEUE {
                warn!(room, queue = %queue, "unrecognized queue name, not released");
            }
        }
        for exchange in &bindings.exchanges {
            if let Some(id) = dedicated_id(ResourceKind::Exchange, exchange) {
                self.broker.delete_exchange(exchange).await?;
                self.pool
                    .release(ResourceKind::Exchange, SharingClass::Dedicated, id)
                    .await?;
            } else if exchange != SHARED_EXCHANGE {
                warn!(room, exchange = %exchange, "unrecognized exchange name, not released");
            }
        }

        self.store.del(&self.keys.room_exchanges(room)).await?;
        self.store.del(&self.keys.room_queues(room)).await?;
        Ok(())
    }

    /// Declare the shared cold infrastructure. Idempotent; safe to call from
    /// every instance on every cold provision.
    async fn ensure_shared_resources(&self) -> Result<()> {
        self.broker
            .declare_exchange(SHARED_EXCHANGE, ExchangeKind::Topic)
            .await?;
        self.broker
            .declare_queue(SHARED_QUEUE, &self.queue_args())
            .await?;
        self.broker
            .bind_queue(SHARED_QUEUE, SHARED_EXCHANGE, SHARED_BINDING_KEY)
            .await?;
        Ok(())
    }

    fn queue_args(&self) -> QueueArgs {
        QueueArgs {
            durable: true,
            max_length: self.sharding.queue_max_length,
            message_ttl: self.sharding.queue_message_ttl,
        }
    }

    async fn last_event(&self, room: RoomId) -> Result<Option<u64>> {
        let raw = self.store.get(&self.keys.room_last_event(room)).await?;
        // Malformed timestamps read as absent so the room can still reconcile
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    /// One pass over all active rooms: reconcile live ones, tear down rooms
    /// whose audience has gone to zero.
    pub async fn sweep_once(&self) -> Result<()> {
        let members = self.store.smembers(&self.keys.active_rooms()).await?;
        metrics::topology().active_rooms.set(members.len() as i64);

        let mut rooms: Vec<RoomId> = Vec::with_capacity(members.len());
        for member in members {
            match member.parse() {
                Ok(room) => rooms.push(room),
                Err(_) => {
                    warn!(member = %member, "dropping malformed room id from active set");
                    self.store.srem(&self.keys.active_rooms(), &member).await?;
                }
            }
        }
        rooms.sort_unstable();

        for room in rooms {
            self.cache.invalidate(room);
            let viewers = self.cache.viewer_count(room).await?;
            if viewers == 0 {
                if let Err(e) = self.cleanup_room(room).await {
                    error!(room, error = %e, "room cleanup failed");
                }
            } else if let Err(e) = self.process_room_status(room).await {
                error!(room, error = %e, "room reconcile failed");
            }
        }
        Ok(())
    }

    /// Tear down an idle room entirely and drop it from the active set
    pub async fn cleanup_room(&self, room: RoomId) -> Result<()> {
        let lock_key = self.keys.room_lock(room);
        let Some(token) = self.lock.try_acquire(&lock_key, self.timing.lock_ttl).await else {
            metrics::topology().lock_contention.inc();
            return Ok(());
        };

        let result = async {
            self.cache.invalidate(room);
            let bindings = self.cache.bindings(room).await?;
            if !bindings.is_empty() {
                self.release_bindings(room, &bindings).await?;
            }

            self.store.del(&self.keys.room_tier(room)).await?;
            self.store.del(&self.keys.room_last_event(room)).await?;
            self.store.del(&self.keys.room_viewers(room)).await?;
            self.store
                .srem(&self.keys.active_rooms(), &room.to_string())
                .await?;
            self.cache.invalidate(room);

            self.store
                .publish(&self.keys.topology_topic(), &room.to_string())
                .await?;

            metrics::topology().rooms_cleaned.inc();
            info!(room, "idle room cleaned up");
            Ok(())
        }
        .await;

        self.lock.release(&lock_key, &token).await;
        result
    }

    /// Stop the sweep task with a bounded wait
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_WAIT, task).await.is_err() {
                warn!("sweep task did not stop in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        broker: Arc<MemoryBroker>,
        manager: TopologyManager,
        keys: Keys,
    }

    fn fixture() -> Fixture {
        let mut config = Config::default();
        // Debounce off so tests can reclassify back-to-back
        config.topology.min_change_interval = Duration::ZERO;

        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let keys = Keys::new(config.cluster.key_prefix.clone());
        let cache = Arc::new(RoomCache::new(
            store.clone(),
            keys.clone(),
            config.tiers.clone(),
            config.cache.room_ttl,
        ));
        let manager = TopologyManager::new(store.clone(), broker.clone(), cache, &config);
        Fixture {
            store,
            broker,
            manager,
            keys,
        }
    }

    async fn set_viewers(f: &Fixture, room: RoomId, viewers: u64) {
        f.store
            .set(&f.keys.room_viewers(room), &viewers.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cold_room_rides_shared_resources() {
        let f = fixture();
        set_viewers(&f, 1, 5).await;

        f.manager.process_room_status(1).await.unwrap();

        assert!(f.broker.has_exchange(SHARED_EXCHANGE));
        assert!(f.broker.has_queue(SHARED_QUEUE));
        assert!(f
            .broker
            .has_binding(SHARED_QUEUE, SHARED_EXCHANGE, SHARED_BINDING_KEY));
        assert_eq!(
            f.store.get(&f.keys.room_tier(1)).await.unwrap().as_deref(),
            Some("COLD")
        );

        let queues = f.store.smembers(&f.keys.room_queues(1)).await.unwrap();
        assert!(queues.contains(SHARED_QUEUE));
    }

    #[tokio::test]
    async fn test_hot_room_gets_dedicated_shards() {
        let f = fixture();
        set_viewers(&f, 2, 5_000).await;

        f.manager.process_room_status(2).await.unwrap();

        assert_eq!(
            f.store.get(&f.keys.room_tier(2)).await.unwrap().as_deref(),
            Some("HOT")
        );

        let exchanges = f.store.smembers(&f.keys.room_exchanges(2)).await.unwrap();
        assert_eq!(exchanges.len(), 1);
        let exchange = exchanges.iter().next().unwrap().clone();
        assert!(exchange.starts_with("danmaku.ex.dedicated."));

        let queues = f.store.smembers(&f.keys.room_queues(2)).await.unwrap();
        assert_eq!(queues.len(), 3);

        let mut sorted: Vec<_> = queues.into_iter().collect();
        sorted.sort();
        for (shard, queue) in sorted.iter().enumerate() {
            assert!(f.broker.has_queue(queue));
            assert!(f.broker.has_binding(queue, &exchange, &routing_key(2, shard)));
        }
    }

    #[tokio::test]
    async fn test_debounce_skips_rapid_changes() {
        let f = fixture();
        // Fixture disables debounce; turn it back on for this test
        let mut config = Config::default();
        config.topology.min_change_interval = Duration::from_secs(60);
        let cache = Arc::new(RoomCache::new(
            f.store.clone(),
            f.keys.clone(),
            config.tiers.clone(),
            config.cache.room_ttl,
        ));
        let manager =
            TopologyManager::new(f.store.clone(), f.broker.clone(), cache, &config);

        set_viewers(&f, 3, 5).await;
        manager.process_room_status(3).await.unwrap();
        assert_eq!(
            f.store.get(&f.keys.room_tier(3)).await.unwrap().as_deref(),
            Some("COLD")
        );

        // Surge right away; the debounce window swallows it
        set_viewers(&f, 3, 5_000).await;
        manager.process_room_status(3).await.unwrap();
        assert_eq!(
            f.store.get(&f.keys.room_tier(3)).await.unwrap().as_deref(),
            Some("COLD")
        );
    }

    #[tokio::test]
    async fn test_reclassification_releases_and_reuses_pool_ids() {
        let f = fixture();
        set_viewers(&f, 4, 500).await;
        f.manager.process_room_status(4).await.unwrap();

        let old_queues = f.store.smembers(&f.keys.room_queues(4)).await.unwrap();
        assert_eq!(old_queues.len(), 1);
        let old_queue = old_queues.iter().next().unwrap().clone();
        assert!(f.broker.has_queue(&old_queue));

        set_viewers(&f, 4, 20_000).await;
        f.manager.process_room_status(4).await.unwrap();

        assert_eq!(
            f.store.get(&f.keys.room_tier(4)).await.unwrap().as_deref(),
            Some("SUPER_HOT")
        );
        let new_queues = f.store.smembers(&f.keys.room_queues(4)).await.unwrap();
        assert_eq!(new_queues.len(), 5);
        // The released shard name comes back out of the pool
        assert!(new_queues.contains(&old_queue));
        for queue in &new_queues {
            assert!(f.broker.has_queue(queue));
        }
    }

    #[tokio::test]
    async fn test_same_tier_is_a_noop() {
        let f = fixture();
        set_viewers(&f, 5, 500).await;
        f.manager.process_room_status(5).await.unwrap();
        let before = f.store.smembers(&f.keys.room_queues(5)).await.unwrap();

        set_viewers(&f, 5, 600).await;
        f.manager.process_room_status(5).await.unwrap();
        let after = f.store.smembers(&f.keys.room_queues(5)).await.unwrap();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_topology_change_is_published() {
        let f = fixture();
        let mut rx = f.store.subscribe(&f.keys.topology_topic());

        set_viewers(&f, 6, 50).await;
        f.manager.process_room_status(6).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "6");
    }

    #[tokio::test]
    async fn test_zero_viewer_room_swept_away() {
        let f = fixture();
        f.manager.mark_room_active(7).await.unwrap();
        set_viewers(&f, 7, 5_000).await;
        f.manager.process_room_status(7).await.unwrap();

        let queues = f.store.smembers(&f.keys.room_queues(7)).await.unwrap();
        assert_eq!(queues.len(), 3);

        set_viewers(&f, 7, 0).await;
        f.manager.sweep_once().await.unwrap();

        for queue in &queues {
            assert!(!f.broker.has_queue(queue));
        }
        let active = f.store.smembers(&f.keys.active_rooms()).await.unwrap();
        assert!(active.is_empty());
        assert_eq!(f.store.get(&f.keys.room_tier(7)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_locked_room_is_skipped() {
        let f = fixture();
        set_viewers(&f, 8, 5_000).await;

        // Someone else holds the room lock
        let lock = DistributedLock::new(f.store.clone());
        let _token = lock
            .try_acquire(&f.keys.room_lock(8), Duration::from_secs(30))
            .await
            .unwrap();

        f.manager.process_room_status(8).await.unwrap();
        assert_eq!(f.store.get(&f.keys.room_tier(8)).await.unwrap(), None);
    }
}
