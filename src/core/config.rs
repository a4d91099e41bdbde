//! Configuration management for roomcast
//!
//! This module handles all configuration settings with defaults tuned for a
//! mid-size fleet. Every knob named by the control plane lives here: virtual
//! node counts, heartbeat TTL, tier thresholds, shard counts, debounce
//! interval, lock TTLs, pool key prefix, and cache expiry.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster membership and hash ring configuration
    pub cluster: ClusterConfig,

    /// Traffic tier thresholds
    pub tiers: TierConfig,

    /// Per-tier sharding and queue sizing
    pub sharding: ShardingConfig,

    /// Topology reconciliation timing
    pub topology: TopologyConfig,

    /// Local cache expiry
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cluster membership and hash ring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Logical pool name this instance joins (e.g. "consumer")
    pub instance_type: String,

    /// Prefix for every key and topic in the coordination store
    pub key_prefix: String,

    /// Heartbeat TTL; entries older than twice this are pruned
    pub heartbeat_ttl: Duration,

    /// Virtual nodes generated per hash seed
    pub vnodes_per_seed: usize,

    /// Number of hash seeds per node (Nginx-style double hashing)
    pub hash_seeds: usize,

    /// Relative weight of this instance on the ring
    pub weight: usize,
}

/// Traffic tier thresholds, ordered cold < normal < hot < super_hot.
///
/// Boundary policy (pinned by tests): a room exactly at `cold_max` is COLD;
/// a room at `hot_min` is HOT; a room at `super_hot_min` is SUPER_HOT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Viewer count at or below which a room is COLD
    pub cold_max: u64,

    /// Viewer count at or above which a room is HOT
    pub hot_min: u64,

    /// Viewer count at or above which a room is SUPER_HOT
    pub super_hot_min: u64,
}

/// Per-tier sharding and queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Shard count for NORMAL rooms (dedicated exchange, fixed shards)
    pub normal_shards: usize,

    /// Shard count for HOT rooms
    pub hot_shards: usize,

    /// Shard count for SUPER_HOT rooms
    pub super_hot_shards: usize,

    /// Maximum queue length before drop-head overflow kicks in
    pub queue_max_length: u32,

    /// Per-message TTL on declared queues
    pub queue_message_ttl: Duration,
}

/// Topology reconciliation timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Minimum interval between tier changes for one room (debounce)
    pub min_change_interval: Duration,

    /// Interval of the scheduled room-status sweep
    pub sweep_interval: Duration,

    /// TTL of the per-room reconciliation lock
    pub lock_ttl: Duration,

    /// TTL of the short-lived consumer bind lock
    pub bind_lock_ttl: Duration,
}

/// Local cache expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long room tier/binding/viewer entries stay fresh locally
    pub room_ttl: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            tiers: TierConfig::default(),
            sharding: ShardingConfig::default(),
            topology: TopologyConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            instance_type: "consumer".to_string(),
            key_prefix: "roomcast".to_string(),
            heartbeat_ttl: Duration::from_secs(25),
            vnodes_per_seed: 40,
            hash_seeds: 4,
            weight: 1,
        }
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            cold_max: 10,
            hot_min: 1_000,
            super_hot_min: 10_000,
        }
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            normal_shards: 1,
            hot_shards: 3,
            super_hot_shards: 5,
            queue_max_length: 100_000,
            queue_message_ttl: Duration::from_secs(60),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            min_change_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(10),
            bind_lock_ttl: Duration::from_secs(10),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            room_ttl: Duration::from_secs(180),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(file_config) = Self::from_file("roomcast.toml") {
            config = file_config;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        if let Ok(instance_type) = env::var("RC_INSTANCE_TYPE") {
            self.cluster.instance_type = instance_type;
        }

        if let Ok(prefix) = env::var("RC_KEY_PREFIX") {
            self.cluster.key_prefix = prefix;
        }

        if let Ok(ttl) = env::var("RC_HEARTBEAT_TTL_SECS") {
            let secs: u64 = ttl
                .parse()
                .map_err(|e| Error::config(format!("Invalid heartbeat TTL: {}", e)))?;
            self.cluster.heartbeat_ttl = Duration::from_secs(secs);
        }

        if let Ok(cold) = env::var("RC_TIER_COLD_MAX") {
            self.tiers.cold_max = cold
                .parse()
                .map_err(|e| Error::config(format!("Invalid cold threshold: {}", e)))?;
        }

        if let Ok(hot) = env::var("RC_TIER_HOT_MIN") {
            self.tiers.hot_min = hot
                .parse()
                .map_err(|e| Error::config(format!("Invalid hot threshold: {}", e)))?;
        }

        if let Ok(super_hot) = env::var("RC_TIER_SUPER_HOT_MIN") {
            self.tiers.super_hot_min = super_hot
                .parse()
                .map_err(|e| Error::config(format!("Invalid super-hot threshold: {}", e)))?;
        }

        if let Ok(interval) = env::var("RC_MIN_CHANGE_INTERVAL_SECS") {
            let secs: u64 = interval
                .parse()
                .map_err(|e| Error::config(format!("Invalid change interval: {}", e)))?;
            self.topology.min_change_interval = Duration::from_secs(secs);
        }

        if let Ok(level) = env::var("RC_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.cluster.instance_type.is_empty() {
            return Err(Error::config("instance_type must not be empty"));
        }

        if self.cluster.vnodes_per_seed == 0 || self.cluster.hash_seeds == 0 {
            return Err(Error::config("virtual node counts must be positive"));
        }

        if self.cluster.weight == 0 {
            return Err(Error::config("instance weight must be positive"));
        }

        if self.cluster.heartbeat_ttl < Duration::from_secs(2) {
            return Err(Error::config("heartbeat TTL must be at least 2 seconds"));
        }

        if self.tiers.cold_max >= self.tiers.hot_min
            || self.tiers.hot_min >= self.tiers.super_hot_min
        {
            return Err(Error::config(
                "tier thresholds must be ordered cold < hot < super_hot",
            ));
        }

        if self.sharding.normal_shards == 0
            || self.sharding.hot_shards == 0
            || self.sharding.super_hot_shards == 0
        {
            return Err(Error::config("shard counts must be positive"));
        }

        Ok(())
    }

    /// Total virtual nodes contributed per unit of weight
    pub fn vnodes_per_weight(&self) -> usize {
        self.cluster.vnodes_per_seed * self.cluster.hash_seeds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vnodes_per_weight(), 160);
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let mut config = Config::default();
        config.tiers.hot_min = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_weight_rejected() {
        let mut config = Config::default();
        config.cluster.weight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.tiers.hot_min, config.tiers.hot_min);
        assert_eq!(parsed.cluster.instance_type, config.cluster.instance_type);
    }
}
