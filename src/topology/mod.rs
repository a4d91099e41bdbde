//! Traffic-aware broker topology
//!
//! Classifies rooms into traffic tiers from viewer counts, caches tier and
//! binding state locally, and reconciles broker exchanges/queues whenever a
//! room's tier shifts.

pub mod cache;
pub mod manager;
pub mod tier;

pub use cache::RoomCache;
pub use manager::TopologyManager;
pub use tier::RoomTier;

/// Room identifier, the unit of partitioning
pub type RoomId = u64;

/// Store keyspace layout shared by the topology and consumer layers.
///
/// All keys and topics hang off one configured prefix so several clusters
/// can share a store.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    /// Create a keyspace rooted at `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Root prefix for the resource ID pool sets
    pub fn pool_prefix(&self) -> String {
        format!("{}:mq", self.prefix)
    }

    /// Set of currently active room IDs
    pub fn active_rooms(&self) -> String {
        format!("{}:rooms:active", self.prefix)
    }

    /// Current viewer count (written by the session layer)
    pub fn room_viewers(&self, room: RoomId) -> String {
        format!("{}:room:{}:viewers", self.prefix, room)
    }

    /// Last published traffic tier
    pub fn room_tier(&self, room: RoomId) -> String {
        format!("{}:room:{}:type", self.prefix, room)
    }

    /// Set of exchange names bound to the room
    pub fn room_exchanges(&self, room: RoomId) -> String {
        format!("{}:room:{}:exchange", self.prefix, room)
    }

    /// Set of queue names bound to the room
    pub fn room_queues(&self, room: RoomId) -> String {
        format!("{}:room:{}:queue", self.prefix, room)
    }

    /// Timestamp of the last topology change, for debounce
    pub fn room_last_event(&self, room: RoomId) -> String {
        format!("{}:room:{}:lastEvent", self.prefix, room)
    }

    /// Per-room reconciliation lock
    pub fn room_lock(&self, room: RoomId) -> String {
        format!("{}:lock:room:{}", self.prefix, room)
    }

    /// Short-lived per-room consumer bind lock
    pub fn bind_lock(&self, room: RoomId) -> String {
        format!("{}:lock:bind:{}", self.prefix, room)
    }

    /// Pub/sub topic announcing room topology changes (payload: room ID)
    pub fn topology_topic(&self) -> String {
        format!("{}:room:topology:change", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_prefixed() {
        let keys = Keys::new("rc");
        assert_eq!(keys.room_viewers(7), "rc:room:7:viewers");
        assert_eq!(keys.active_rooms(), "rc:rooms:active");
        assert_eq!(keys.topology_topic(), "rc:room:topology:change");
    }
}
