//! Traffic tier classification
//!
//! Every room sits in exactly one tier derived from its current viewer
//! count. The tier decides whether the room shares broker resources with
//! other quiet rooms or gets its own exchange and sharded queues.

use crate::coord::pool::SharingClass;
use crate::core::config::{ShardingConfig, TierConfig};
use std::fmt;
use std::str::FromStr;

/// Traffic tier of a room, ordered by viewer count
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoomTier {
    /// At or below the cold threshold; rides the shared topic exchange
    Cold,
    /// Between the cold and hot thresholds
    Normal,
    /// At or above the hot threshold; sharded dedicated queues
    Hot,
    /// At or above the super-hot threshold; widest shard fan-out
    SuperHot,
}

impl RoomTier {
    /// Classify a viewer count against configured thresholds.
    ///
    /// Boundaries are pinned: a count exactly at `cold_max` is still COLD,
    /// while counts exactly at `hot_min` / `super_hot_min` already belong
    /// to the hotter tier.
    pub fn classify(viewers: u64, tiers: &TierConfig) -> RoomTier {
        if viewers >= tiers.super_hot_min {
            RoomTier::SuperHot
        } else if viewers >= tiers.hot_min {
            RoomTier::Hot
        } else if viewers <= tiers.cold_max {
            RoomTier::Cold
        } else {
            RoomTier::Normal
        }
    }

    /// Whether rooms in this tier share broker resources or own them
    pub fn sharing_class(self) -> SharingClass {
        match self {
            RoomTier::Cold => SharingClass::Shared,
            _ => SharingClass::Dedicated,
        }
    }

    /// Number of queue shards declared for a room in this tier
    pub fn shard_count(self, sharding: &ShardingConfig) -> usize {
        match self {
            RoomTier::Cold => 1,
            RoomTier::Normal => sharding.normal_shards,
            RoomTier::Hot => sharding.hot_shards,
            RoomTier::SuperHot => sharding.super_hot_shards,
        }
    }

    /// Stable name persisted in the coordination store
    pub fn as_str(self) -> &'static str {
        match self {
            RoomTier::Cold => "COLD",
            RoomTier::Normal => "NORMAL",
            RoomTier::Hot => "HOT",
            RoomTier::SuperHot => "SUPER_HOT",
        }
    }
}

impl fmt::Display for RoomTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomTier {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "COLD" => Ok(RoomTier::Cold),
            "NORMAL" => Ok(RoomTier::Normal),
            "HOT" => Ok(RoomTier::Hot),
            "SUPER_HOT" => Ok(RoomTier::SuperHot),
            _ => Err(()),
        }
    }
}
