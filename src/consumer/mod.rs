//! Consumer binding coordination
//!
//! Decides which queues this instance consumes from, driven by hash-ring
//! ownership. Each dedicated room's queue shards are consumed by the ring
//! owner of the room ID; the shared cold queue is consumed by the ring owner
//! of its own well-known name, so exactly one instance drains it. All
//! reconciliation here is idempotent and convergent: duplicate or
//! out-of-order events re-derive the same bindings from store state plus the
//! local ring, never accumulate state.

use crate::broker::{BrokerAdmin, ExchangeKind, QueueArgs};
use crate::cluster::membership::{ClusterEvent, InstanceManager};
use crate::coord::lock::DistributedLock;
use crate::coord::pool::SharingClass;
use crate::core::config::{Config, ShardingConfig};
use crate::core::error::Result;
use crate::store::CoordinationStore;
use crate::system::metrics;
use crate::topology::manager::{
    routing_key, SHARED_BINDING_KEY, SHARED_EXCHANGE, SHARED_QUEUE,
};
use crate::topology::{Keys, RoomCache, RoomId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Binds this instance's consumers to the queues it owns
pub struct ConsumerCoordinator {
    store: Arc<dyn CoordinationStore>,
    broker: Arc<dyn BrokerAdmin>,
    membership: Arc<InstanceManager>,
    cache: Arc<RoomCache>,
    keys: Keys,
    lock: DistributedLock,
    bind_lock_ttl: Duration,
    resync_interval: Duration,
    sharding: ShardingConfig,
    /// Rooms whose dedicated queues this instance currently consumes
    bound: DashMap<RoomId, Vec<String>>,
    /// Whether this instance currently drains the shared cold queue
    shared_consuming: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerCoordinator {
    /// Build a coordinator over this instance's membership view
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        broker: Arc<dyn BrokerAdmin>,
        membership: Arc<InstanceManager>,
        cache: Arc<RoomCache>,
        config: &Config,
    ) -> Self {
        let keys = Keys::new(config.cluster.key_prefix.clone());
        let lock = DistributedLock::new(store.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            store,
            broker,
            membership,
            cache,
            keys,
            lock,
            bind_lock_ttl: config.topology.bind_lock_ttl,
            resync_interval: config.topology.sweep_interval,
            sharding: config.sharding.clone(),
            bound: DashMap::new(),
            shared_consuming: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind everything this instance owns, then keep converging on topology
    /// events, membership changes, and a periodic resync.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.rebalance().await?;
        self.spawn_topology_listener();
        self.spawn_membership_listener();
        self.spawn_resync();
        info!(
            instance_id = %self.membership.instance_id(),
            rooms = self.bound.len(),
            "consumer coordinator started"
        );
        Ok(())
    }

    fn spawn_topology_listener(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut rx = self.store.subscribe(&self.keys.topology_topic());
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Ok(payload) => coordinator.handle_topology_event(&payload).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "topology events lagged, rebalancing");
                            if let Err(e) = coordinator.rebalance().await {
                                error!(error = %e, "rebalance after lag failed");
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

    fn spawn_membership_listener(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut rx = self.membership.subscribe();
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        // Every membership change ends in a RingRebuilt, so
                        // reacting to that one event covers add and remove
                        Ok(ClusterEvent::RingRebuilt) => {
                            if let Err(e) = coordinator.rebalance().await {
                                error!(error = %e, "rebalance after ring change failed");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "membership events lagged, rebalancing");
                            if let Err(e) = coordinator.rebalance().await {
                                error!(error = %e, "rebalance after lag failed");
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

    fn spawn_resync(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(coordinator.resync_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = coordinator.rebalance().await {
                            error!(error = %e, "periodic resync failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// React to one room's topology changing
    pub async fn handle_topology_event(&self, payload: &str) {
        let Ok(room) = payload.parse::<RoomId>() else {
            warn!(payload, "malformed topology event");
            return;
        };
        if let Err(e) = self.sync_room(room).await {
            error!(room, error = %e, "room consumer sync failed");
        }
        if let Err(e) = self.sync_shared_consumer().await {
            error!(error = %e, "shared consumer sync failed");
        }
    }

    /// Re-derive every binding from store state and the current ring
    pub async fn rebalance(&self) -> Result<()> {
        self.sync_shared_consumer().await?;

        let mut rooms: BTreeSet<RoomId> = self.bound.iter().map(|e| *e.key()).collect();
        for member in self.store.smembers(&self.keys.active_rooms()).await? {
            match member.parse() {
                Ok(room) => {
                    rooms.insert(room);
                }
                Err(_) => warn!(member = %member, "skipping malformed room id in active set"),
            }
        }

        for room in rooms {
            if let Err(e) = self.sync_room(room).await {
                error!(room, error = %e, "room consumer sync failed");
            }
        }

        metrics::consumer().rebalances.inc();
        Ok(())
    }

    /// Converge one room: bind its queues if this instance owns it, release
    /// them if it doesn't or the room no longer has a dedicated topology.
    pub async fn sync_room(&self, room: RoomId) -> Result<()> {
        self.cache.invalidate(room);

        if !self.membership.is_responsible_for(&room.to_string()) {
            self.release_room(room).await;
            return Ok(());
        }

        let Some(tier) = self.cache.published_tier(room).await? else {
            // Room was cleaned up (or never provisioned)
            self.release_room(room).await;
            return Ok(());
        };
        if tier.sharing_class() == SharingClass::Shared {
            // Cold traffic drains through the shared queue's own consumer
            self.release_room(room).await;
            return Ok(());
        }

        let bindings = self.cache.bindings(room).await?;
        if bindings.queues.is_empty() || bindings.exchanges.len() != 1 {
            // Topology mid-transition; the change event will bring us back
            debug!(room, "topology incomplete, deferring bind");
            return Ok(());
        }

        if self
            .bound
            .get(&room)
            .is_some_and(|queues| *queues == bindings.queues)
        {
            return Ok(());
        }

        let lock_key = self.keys.bind_lock(room);
        let Some(token) = self.lock.try_acquire(&lock_key, self.bind_lock_ttl).await else {
            debug!(room, "bind lock held elsewhere, deferring");
            return Ok(());
        };

        let result = self.bind_room(room, &bindings.exchanges[0], &bindings.queues).await;
        self.lock.release(&lock_key, &token).await;
        result
    }

    async fn bind_room(&self, room: RoomId, exchange: &str, queues: &[String]) -> Result<()> {
        // Declares are idempotent; re-asserting topology here lets a fresh
        // owner recover from a half-finished transition
        let args = self.queue_args();
        for (shard, queue) in queues.iter().enumerate() {
            self.broker.declare_queue(queue, &args).await?;
            self.broker
                .bind_queue(queue, exchange, &routing_key(room, shard))
                .await?;
            self.broker.ensure_consumer(queue).await?;
            metrics::consumer().queues_bound.inc();
        }

        self.bound.insert(room, queues.to_vec());
        info!(room, queues = queues.len(), "room queues bound");
        Ok(())
    }

    /// Cancel this instance's consumers on a room it no longer serves
    async fn release_room(&self, room: RoomId) {
        let Some((_, queues)) = self.bound.remove(&room) else {
            return;
        };
        for queue in &queues {
            // Bindings stay in place for whichever instance takes over
            if let Err(e) = self.broker.cancel_consumer(queue).await {
                error!(room, queue = %queue, error = %e, "consumer cancel failed");
            }
            metrics::consumer().queues_unbound.inc();
        }
        info!(room, queues = queues.len(), "room queues released");
    }

    /// Attach or detach the shared cold-queue consumer based on ring
    /// ownership of the queue's own name.
    async fn sync_shared_consumer(&self) -> Result<()> {
        let owner = self.membership.is_responsible_for(SHARED_QUEUE);
        let consuming = self.shared_consuming.load(Ordering::Acquire);

        if owner && !consuming {
            self.broker
                .declare_exchange(SHARED_EXCHANGE, ExchangeKind::Topic)
                .await?;
            self.broker
                .declare_queue(SHARED_QUEUE, &self.queue_args())
                .await?;
            self.broker
                .bind_queue(SHARED_QUEUE, SHARED_EXCHANGE, SHARED_BINDING_KEY)
                .await?;
            self.broker.ensure_consumer(SHARED_QUEUE).await?;
            self.shared_consuming.store(true, Ordering::Release);
            metrics::consumer().queues_bound.inc();
            info!("shared cold queue consumer attached");
        } else if !owner && consuming {
            self.broker.cancel_consumer(SHARED_QUEUE).await?;
            self.shared_consuming.store(false, Ordering::Release);
            metrics::consumer().queues_unbound.inc();
            info!("shared cold queue consumer detached");
        }
        Ok(())
    }

    fn queue_args(&self) -> QueueArgs {
        QueueArgs {
            durable: true,
            max_length: self.sharding.queue_max_length,
            message_ttl: self.sharding.queue_message_ttl,
        }
    }

    /// Number of rooms whose queues this instance currently consumes
    pub fn bound_room_count(&self) -> usize {
        self.bound.len()
    }

    /// Stop background tasks and cancel every consumer this instance holds
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_WAIT, task).await.is_err() {
                warn!("consumer task did not stop in time");
            }
        }

        let rooms: Vec<RoomId> = self.bound.iter().map(|e| *e.key()).collect();
        for room in rooms {
            self.release_room(room).await;
        }
        if self.shared_consuming.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.broker.cancel_consumer(SHARED_QUEUE).await {
                error!(error = %e, "shared consumer cancel failed");
            }
        }
        info!("consumer coordinator shut down");
    }
}
