//! Metrics collection for the control plane
//!
//! Prometheus counters and gauges covering the three event loops: membership
//! (heartbeats, rebuilds), topology reconciliation (reclassifications,
//! debounce skips, lock contention), and consumer binding churn.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Registry};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Cluster membership metrics
pub struct ClusterMetrics {
    /// Heartbeats sent by this instance
    pub heartbeats_sent: IntCounter,
    /// Wholesale ring rebuilds performed
    pub ring_rebuilds: IntCounter,
    /// Instances currently on the local ring
    pub known_instances: IntGauge,
}

/// Topology reconciliation metrics
pub struct TopologyMetrics {
    /// Tier changes that reprovisioned broker resources
    pub reclassifications: IntCounter,
    /// Reconciliations skipped by the debounce window
    pub debounce_skips: IntCounter,
    /// Reconciliations skipped because another instance held the room lock
    pub lock_contention: IntCounter,
    /// Rooms cleaned up after going idle
    pub rooms_cleaned: IntCounter,
    /// Rooms currently tracked as active
    pub active_rooms: IntGauge,
}

/// Consumer binding metrics
pub struct ConsumerMetrics {
    /// Queue bindings established by this instance
    pub queues_bound: IntCounter,
    /// Queue bindings torn down by this instance
    pub queues_unbound: IntCounter,
    /// Full ownership rebalances performed
    pub rebalances: IntCounter,
}

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("metric definition");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
}

static CLUSTER: Lazy<ClusterMetrics> = Lazy::new(|| ClusterMetrics {
    heartbeats_sent: counter("roomcast_heartbeats_sent_total", "Heartbeats sent"),
    ring_rebuilds: counter("roomcast_ring_rebuilds_total", "Hash ring rebuilds"),
    known_instances: gauge("roomcast_known_instances", "Instances on the local ring"),
});

static TOPOLOGY: Lazy<TopologyMetrics> = Lazy::new(|| TopologyMetrics {
    reclassifications: counter(
        "roomcast_reclassifications_total",
        "Tier changes that reprovisioned resources",
    ),
    debounce_skips: counter(
        "roomcast_debounce_skips_total",
        "Reconciliations skipped inside the debounce window",
    ),
    lock_contention: counter(
        "roomcast_lock_contention_total",
        "Reconciliations skipped on lock contention",
    ),
    rooms_cleaned: counter("roomcast_rooms_cleaned_total", "Idle rooms cleaned up"),
    active_rooms: gauge("roomcast_active_rooms", "Rooms tracked as active"),
});

static CONSUMER: Lazy<ConsumerMetrics> = Lazy::new(|| ConsumerMetrics {
    queues_bound: counter("roomcast_queues_bound_total", "Queue bindings established"),
    queues_unbound: counter("roomcast_queues_unbound_total", "Queue bindings removed"),
    rebalances: counter("roomcast_rebalances_total", "Ownership rebalances"),
});

/// Cluster membership metrics
pub fn cluster() -> &'static ClusterMetrics {
    &CLUSTER
}

/// Topology reconciliation metrics
pub fn topology() -> &'static TopologyMetrics {
    &TOPOLOGY
}

/// Consumer binding metrics
pub fn consumer() -> &'static ConsumerMetrics {
    &CONSUMER
}

/// Force registration of all metric families
pub fn init_registry() {
    Lazy::force(&CLUSTER);
    Lazy::force(&TOPOLOGY);
    Lazy::force(&CONSUMER);
}

/// Gather all registered metric families for exposition
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}
