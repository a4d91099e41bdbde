//! Instance membership manager
//!
//! Registers this process in the shared membership map, heartbeats to keep
//! the entry fresh, and rebuilds the local hash ring wholesale whenever any
//! instance announces a change. Entries whose heartbeat is older than twice
//! the TTL are pruned during rebuild and deleted from the shared map; missed
//! heartbeats are the only failure detection mechanism. A false positive is
//! self-healing because the instance's next heartbeat re-registers it.
//!
//! Membership state flows to the rest of the process as [`ClusterEvent`]s on
//! a broadcast channel, so consumers react to messages instead of holding a
//! reference back into this manager.

use crate::cluster::hash::ConsistentHashRing;
use crate::core::config::ClusterConfig;
use crate::core::error::Result;
use crate::store::CoordinationStore;
use crate::system::metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Membership change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// An instance joined the pool
    InstanceAdded(String),
    /// An instance left (expired or went offline)
    InstanceRemoved(String),
    /// The local ring was rebuilt; ownership may have shifted
    RingRebuilt,
}

/// Registers, heartbeats, and discovers peer instances
pub struct InstanceManager {
    store: Arc<dyn CoordinationStore>,
    ring: Arc<ConsistentHashRing<String>>,
    instance_id: String,
    instances_key: String,
    change_topic: String,
    heartbeat_ttl: Duration,
    weight: usize,
    events: broadcast::Sender<ClusterEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl InstanceManager {
    /// Create a manager for this process. `start` must be called before the
    /// ring answers ownership queries.
    pub fn new(store: Arc<dyn CoordinationStore>, config: &ClusterConfig) -> Self {
        let instance_id = format!("{}-{}", config.instance_type, Uuid::new_v4());
        let ring = Arc::new(ConsistentHashRing::new(
            config.vnodes_per_seed,
            config.hash_seeds,
        ));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown, _) = watch::channel(false);

        Self {
            store,
            ring,
            instance_id,
            instances_key: format!(
                "{}:instances:{}",
                config.key_prefix, config.instance_type
            ),
            change_topic: format!(
                "{}:instance:change:{}",
                config.key_prefix, config.instance_type
            ),
            heartbeat_ttl: config.heartbeat_ttl,
            weight: config.weight,
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// This process's unique instance ID
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Subscribe to membership change events
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Register, start the heartbeat, listen for peer changes, and build the
    /// initial ring.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.register().await?;
        self.store
            .publish(&self.change_topic, &format!("add:{}", self.instance_id))
            .await?;
        self.rebuild_ring().await?;

        self.spawn_heartbeat();
        self.spawn_change_listener();

        tracing::info!(
            instance_id = %self.instance_id,
            peers = self.ring.node_count(),
            "instance manager started"
        );
        Ok(())
    }

    async fn register(&self) -> Result<()> {
        let value = format!("{}:{}", now_millis(), self.weight);
        self.store
            .hset(&self.instances_key, &self.instance_id, &value)
            .await?;
        Ok(())
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.heartbeat_ttl / 2);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = manager.heartbeat_tick().await {
                            tracing::error!(error = %e, "heartbeat tick failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn heartbeat_tick(&self) -> Result<()> {
        self.register().await?;
        metrics::cluster().heartbeats_sent.inc();
        // Piggyback expiry pruning on the heartbeat so a quiet cluster still
        // converges on dead peers.
        self.rebuild_ring().await?;
        Ok(())
    }

    fn spawn_change_listener(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut rx = self.store.subscribe(&self.change_topic);
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Ok(payload) => manager.handle_change_event(&payload).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "membership events lagged, rebuilding");
                            if let Err(e) = manager.rebuild_ring().await {
                                tracing::error!(error = %e, "ring rebuild after lag failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn handle_change_event(&self, payload: &str) {
        let Some((op, peer)) = payload.split_once(':') else {
            tracing::warn!(payload, "malformed instance change event");
            return;
        };

        let event = match op {
            "add" => Some(ClusterEvent::InstanceAdded(peer.to_string())),
            "remove" | "offline" => Some(ClusterEvent::InstanceRemoved(peer.to_string())),
            "rebuild" => None,
            other => {
                tracing::warn!(op = other, "unknown instance change op");
                return;
            }
        };

        tracing::info!(op, peer, "instance change received");
        if let Err(e) = self.rebuild_ring().await {
            tracing::error!(error = %e, "ring rebuild failed");
            return;
        }

        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        let _ = self.events.send(ClusterEvent::RingRebuilt);
    }

    /// Rebuild the local ring wholesale from the shared membership map,
    /// pruning entries whose heartbeat aged past `2 x ttl`.
    pub async fn rebuild_ring(&self) -> Result<()> {
        let entries = self.store.hgetall(&self.instances_key).await?;
        let threshold = now_millis().saturating_sub(2 * self.heartbeat_ttl.as_millis() as u64);

        self.ring.clear();
        for (id, value) in entries {
            match parse_member_value(&value) {
                Some((ts, weight)) if ts >= threshold => {
                    self.ring.add_weighted_node(id, weight);
                }
                _ => {
                    // Expired (or unparsable, treated the same). Delete the
                    // shared entry and tell peers so everyone converges.
                    tracing::info!(instance_id = %id, "pruning expired instance");
                    self.store.hdel(&self.instances_key, &id).await?;
                    self.store
                        .publish(&self.change_topic, &format!("remove:{}", id))
                        .await?;
                }
            }
        }

        metrics::cluster().ring_rebuilds.inc();
        metrics::cluster()
            .known_instances
            .set(self.ring.node_count() as i64);
        Ok(())
    }

    /// Ask all peers (including this process) to rebuild their rings
    pub async fn request_ring_rebuild(&self) -> Result<()> {
        self.store
            .publish(&self.change_topic, &format!("rebuild:{}", self.instance_id))
            .await?;
        Ok(())
    }

    /// Whether this instance owns `key`, per the local ring. A pure local
    /// read; stale at most by one rebuild latency. False on an empty ring:
    /// no known instances means "no owner", never "me by default".
    pub fn is_responsible_for(&self, key: &str) -> bool {
        self.ring.is_responsible(&self.instance_id, key)
    }

    /// Owning instance for `key`, if any instance is known
    pub fn responsible_instance(&self, key: &str) -> Option<String> {
        self.ring.get_node(key)
    }

    /// Number of live instances on the local ring
    pub fn instance_count(&self) -> usize {
        self.ring.node_count()
    }

    /// The local ring, shared for diagnostics
    pub fn ring(&self) -> &ConsistentHashRing<String> {
        &self.ring
    }

    /// Publish offline, remove the shared entry, and stop background tasks
    /// with a bounded wait.
    pub async fn shutdown(&self) {
        if let Err(e) = self
            .store
            .publish(&self.change_topic, &format!("offline:{}", self.instance_id))
            .await
        {
            tracing::error!(error = %e, "failed to publish offline notice");
        }
        if let Err(e) = self.store.hdel(&self.instances_key, &self.instance_id).await {
            tracing::error!(error = %e, "failed to remove membership entry");
        }

        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_WAIT, task).await.is_err() {
                tracing::warn!("background task did not stop in time");
            }
        }
        tracing::info!(instance_id = %self.instance_id, "instance manager shut down");
    }
}

/// Parse a membership hash value of the form `{timestamp_ms}:{weight}`.
/// Unparsable values are treated as absent.
fn parse_member_value(value: &str) -> Option<(u64, usize)> {
    let (ts, weight) = value.split_once(':')?;
    Some((ts.parse().ok()?, weight.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ClusterConfig;
    use crate::store::MemoryStore;

    fn config() -> ClusterConfig {
        ClusterConfig {
            heartbeat_ttl: Duration::from_secs(5),
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_single_instance_owns_everything() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let manager = Arc::new(InstanceManager::new(store, &config()));
        manager.start().await.unwrap();

        assert_eq!(manager.instance_count(), 1);
        assert!(manager.is_responsible_for("room-1"));
        assert_eq!(
            manager.responsible_instance("room-1").unwrap(),
            manager.instance_id()
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_instances_split_ownership() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let a = Arc::new(InstanceManager::new(store.clone(), &config()));
        let b = Arc::new(InstanceManager::new(store.clone(), &config()));
        a.start().await.unwrap();
        b.start().await.unwrap();

        // b registered after a's initial rebuild; refresh a directly
        a.rebuild_ring().await.unwrap();

        assert_eq!(a.instance_count(), 2);
        assert_eq!(b.instance_count(), 2);

        for key in 0..200 {
            let key = key.to_string();
            assert_eq!(
                a.responsible_instance(&key),
                b.responsible_instance(&key),
                "instances disagree on owner of {}",
                key
            );
            let owned_by_both = a.is_responsible_for(&key) && b.is_responsible_for(&key);
            assert!(!owned_by_both);
        }

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_instance_is_pruned_and_removed_from_store() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let manager = Arc::new(InstanceManager::new(store.clone(), &config()));
        manager.start().await.unwrap();

        // Plant a peer whose heartbeat is far in the past
        let stale_ts = now_millis() - 60_000;
        store
            .hset(
                &manager.instances_key,
                "consumer-dead",
                &format!("{}:1", stale_ts),
            )
            .await
            .unwrap();

        manager.rebuild_ring().await.unwrap();

        assert_eq!(manager.instance_count(), 1);
        let entries = store.hgetall(&manager.instances_key).await.unwrap();
        assert!(!entries.contains_key("consumer-dead"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_entry_treated_as_expired() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let manager = Arc::new(InstanceManager::new(store.clone(), &config()));
        manager.start().await.unwrap();

        store
            .hset(&manager.instances_key, "consumer-junk", "not-a-timestamp")
            .await
            .unwrap();
        manager.rebuild_ring().await.unwrap();

        assert_eq!(manager.instance_count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_removes_own_entry_and_notifies() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let a = Arc::new(InstanceManager::new(store.clone(), &config()));
        a.start().await.unwrap();

        let topic = a.change_topic.clone();
        let mut rx = store.subscribe(&topic);

        let instances_key = a.instances_key.clone();
        let id = a.instance_id().to_string();
        a.shutdown().await;

        assert_eq!(rx.recv().await.unwrap(), format!("offline:{}", id));
        let entries = store.hgetall(&instances_key).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_change_event_emits_cluster_events() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let manager = Arc::new(InstanceManager::new(store, &config()));
        manager.start().await.unwrap();

        let mut events = manager.subscribe();
        manager.handle_change_event("add:consumer-peer").await;

        assert_eq!(
            events.recv().await.unwrap(),
            ClusterEvent::InstanceAdded("consumer-peer".to_string())
        );
        assert_eq!(events.recv().await.unwrap(), ClusterEvent::RingRebuilt);
        manager.shutdown().await;
    }
}
