//! Worker node assembly
//!
//! Wires one process's control-plane components together over a shared
//! coordination store and a broker admin handle: membership and the hash
//! ring, topology reconciliation, and consumer binding. The session layer
//! feeds viewer counts in through [`WorkerNode::report_room_status`];
//! everything downstream of that is event-driven.

use crate::broker::BrokerAdmin;
use crate::cluster::membership::InstanceManager;
use crate::consumer::ConsumerCoordinator;
use crate::core::config::Config;
use crate::core::error::Result;
use crate::store::CoordinationStore;
use crate::topology::{Keys, RoomCache, RoomId, TopologyManager};
use std::sync::Arc;
use tracing::info;

/// One control-plane instance
pub struct WorkerNode {
    store: Arc<dyn CoordinationStore>,
    keys: Keys,
    membership: Arc<InstanceManager>,
    topology: Arc<TopologyManager>,
    consumers: Arc<ConsumerCoordinator>,
}

impl WorkerNode {
    /// Assemble a node over pluggable store and broker backends
    pub fn new(
        config: &Config,
        store: Arc<dyn CoordinationStore>,
        broker: Arc<dyn BrokerAdmin>,
    ) -> Self {
        let keys = Keys::new(config.cluster.key_prefix.clone());
        let cache = Arc::new(RoomCache::new(
            store.clone(),
            keys.clone(),
            config.tiers.clone(),
            config.cache.room_ttl,
        ));
        let membership = Arc::new(InstanceManager::new(store.clone(), &config.cluster));
        let topology = Arc::new(TopologyManager::new(
            store.clone(),
            broker.clone(),
            cache.clone(),
            config,
        ));
        let consumers = Arc::new(ConsumerCoordinator::new(
            store.clone(),
            broker,
            membership.clone(),
            cache,
            config,
        ));

        Self {
            store,
            keys,
            membership,
            topology,
            consumers,
        }
    }

    /// Join the cluster and start all background reconciliation
    pub async fn start(&self) -> Result<()> {
        self.membership.start().await?;
        self.topology.start();
        self.consumers.start().await?;
        info!(instance_id = %self.membership.instance_id(), "worker node started");
        Ok(())
    }

    /// Ingest a room's current viewer count and reconcile its topology.
    ///
    /// This is the session layer's entry point; it is safe to call from any
    /// instance for any room at any rate, because debounce and the per-room
    /// lock bound the actual reconciliation work.
    pub async fn report_room_status(&self, room: RoomId, viewers: u64) -> Result<()> {
        self.store
            .set(&self.keys.room_viewers(room), &viewers.to_string())
            .await?;
        self.topology.mark_room_active(room).await?;
        self.topology.process_room_status(room).await
    }

    /// This instance's cluster identity
    pub fn instance_id(&self) -> &str {
        self.membership.instance_id()
    }

    /// Cluster membership and ring ownership
    pub fn membership(&self) -> &Arc<InstanceManager> {
        &self.membership
    }

    /// Room topology reconciliation
    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    /// Consumer binding coordination
    pub fn consumers(&self) -> &Arc<ConsumerCoordinator> {
        &self.consumers
    }

    /// Leave the cluster cleanly: stop consuming first, then the sweep, then
    /// deregister so peers rebalance onto live instances only.
    pub async fn shutdown(&self) {
        self.consumers.shutdown().await;
        self.topology.shutdown().await;
        self.membership.shutdown().await;
        info!("worker node shut down");
    }
}
