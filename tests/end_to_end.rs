//! Multi-instance convergence tests
//!
//! Drive whole worker nodes over one shared in-memory store, each with its
//! own broker handle, and assert the cluster converges: every room's queues
//! end up consumed by exactly one instance, reclassification moves resources,
//! and departures rebalance ownership onto the survivors.

use roomcast::broker::MemoryBroker;
use roomcast::core::Config;
use roomcast::store::{CoordinationStore, MemoryStore};
use roomcast::topology::manager::SHARED_QUEUE;
use roomcast::WorkerNode;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> Config {
    let mut config = Config::default();
    config.topology.min_change_interval = Duration::ZERO;
    config
}

/// Poll until `check` passes or a bounded window expires
async fn converge<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_room_lifecycle_cold_to_hot_to_gone() {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let node = WorkerNode::new(&test_config(), store.clone(), broker.clone());
    node.start().await.unwrap();

    // New room with a tiny audience rides the shared queue
    node.report_room_status(1, 5).await.unwrap();
    assert_eq!(
        store.get("roomcast:room:1:type").await.unwrap().as_deref(),
        Some("COLD")
    );
    let broker_cold = broker.clone();
    assert!(converge(move || broker_cold.consumed_queues().contains(SHARED_QUEUE)).await);

    // Audience surges; room gets a dedicated exchange and three shards
    node.report_room_status(1, 5_000).await.unwrap();
    assert_eq!(
        store.get("roomcast:room:1:type").await.unwrap().as_deref(),
        Some("HOT")
    );
    let queues = store.smembers("roomcast:room:1:queue").await.unwrap();
    assert_eq!(queues.len(), 3);
    for queue in &queues {
        assert!(queue.starts_with("danmaku.q.dedicated."));
    }
    let broker_hot = broker.clone();
    let hot_queues = queues.clone();
    assert!(converge(move || broker_hot.consumed_queues().is_superset(&hot_queues)).await);

    // Audience leaves; the sweep tears everything down
    node.report_room_status(1, 0).await.unwrap();
    node.topology().sweep_once().await.unwrap();
    assert_eq!(store.get("roomcast:room:1:type").await.unwrap(), None);
    for queue in &queues {
        assert!(!broker.has_queue(queue));
    }
    let broker_gone = broker.clone();
    assert!(
        converge(move || {
            let consumed = broker_gone.consumed_queues();
            !consumed.iter().any(|q| q.starts_with("danmaku.q.dedicated."))
        })
        .await
    );

    node.shutdown().await;
}

#[tokio::test]
async fn test_two_nodes_split_rooms_with_single_consumers() {
    let store = Arc::new(MemoryStore::new());
    let broker_a = Arc::new(MemoryBroker::new());
    let broker_b = Arc::new(MemoryBroker::new());

    let a = WorkerNode::new(&test_config(), store.clone(), broker_a.clone());
    let b = WorkerNode::new(&test_config(), store.clone(), broker_b.clone());
    a.start().await.unwrap();
    b.start().await.unwrap();

    // Both rings agree on the full membership before any rooms appear
    let (ma, mb) = (a.membership().clone(), b.membership().clone());
    assert!(converge(move || ma.instance_count() == 2 && mb.instance_count() == 2).await);

    let rooms: Vec<u64> = (10..30).collect();
    for &room in &rooms {
        a.report_room_status(room, 5_000).await.unwrap();
    }

    for &room in &rooms {
        let queues = store
            .smembers(&format!("roomcast:room:{}:queue", room))
            .await
            .unwrap();
        assert_eq!(queues.len(), 3);

        let owner_is_a = a.membership().is_responsible_for(&room.to_string());
        let (owner, other) = if owner_is_a {
            (broker_a.clone(), broker_b.clone())
        } else {
            (broker_b.clone(), broker_a.clone())
        };

        let expected = queues.clone();
        assert!(
            converge(move || owner.consumed_queues().is_superset(&expected)).await,
            "room {} queues never consumed by their owner",
            room
        );
        for queue in &queues {
            assert!(
                !other.consumed_queues().contains(queue),
                "room {} queue {} consumed by a non-owner",
                room,
                queue
            );
        }
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_node_departure_rebalances_onto_survivor() {
    let store = Arc::new(MemoryStore::new());
    let broker_a = Arc::new(MemoryBroker::new());
    let broker_b = Arc::new(MemoryBroker::new());

    let a = WorkerNode::new(&test_config(), store.clone(), broker_a.clone());
    let b = WorkerNode::new(&test_config(), store.clone(), broker_b.clone());
    a.start().await.unwrap();
    b.start().await.unwrap();

    let (ma, mb) = (a.membership().clone(), b.membership().clone());
    assert!(converge(move || ma.instance_count() == 2 && mb.instance_count() == 2).await);

    let rooms: Vec<u64> = (40..50).collect();
    let mut all_queues = std::collections::HashSet::new();
    for &room in &rooms {
        a.report_room_status(room, 5_000).await.unwrap();
        all_queues.extend(
            store
                .smembers(&format!("roomcast:room:{}:queue", room))
                .await
                .unwrap(),
        );
    }

    // b leaves cleanly; its offline notice drives a's rebalance
    b.shutdown().await;

    let ma = a.membership().clone();
    assert!(converge(move || ma.instance_count() == 1).await);
    let survivor = broker_a.clone();
    let expected = all_queues.clone();
    assert!(
        converge(move || survivor.consumed_queues().is_superset(&expected)).await,
        "survivor never picked up every queue"
    );
    assert!(broker_b.consumed_queues().is_empty());

    a.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_and_stale_events_are_harmless() {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let node = WorkerNode::new(&test_config(), store.clone(), broker.clone());
    node.start().await.unwrap();

    node.report_room_status(60, 5_000).await.unwrap();
    let queues = store.smembers("roomcast:room:60:queue").await.unwrap();

    // Hammer the coordinator with duplicates, a stale room, and junk
    for _ in 0..5 {
        node.consumers().handle_topology_event("60").await;
    }
    node.consumers().handle_topology_event("9999").await;
    node.consumers().handle_topology_event("garbage").await;
    node.consumers().rebalance().await.unwrap();

    let consumed = broker.consumed_queues();
    assert!(consumed.is_superset(&queues));
    assert_eq!(node.consumers().bound_room_count(), 1);

    node.shutdown().await;
}
