//! Weighted consistent hash ring
//!
//! Maps partition keys (room IDs) to owning instances. Each node contributes
//! `vnodes_per_seed * seeds * weight` virtual nodes, generated Nginx-style
//! from seeded names `{node}#{seq}@{seed}` so positions spread uniformly.
//! Lookup walks to the first ring entry at or past the key hash, wrapping to
//! the smallest entry.
//!
//! Adding or removing a node touches only that node's own virtual nodes, so
//! key movement is minimal. Re-adding an existing node (weight update) fully
//! removes then re-adds it; a concurrent lookup inside that window may
//! transiently see none of that node's virtual nodes.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;

/// Pluggable hash function for ring positions.
///
/// Implementations must produce at least 32 bits of entropy from the virtual
/// node name; the default is cryptographic-strength for uniform spread.
pub trait RingHasher: Send + Sync {
    /// Hash a key to a ring position
    fn hash(&self, key: &str) -> u64;
}

/// Default hasher: BLAKE3, truncated to 64 bits
pub struct Blake3Hasher;

impl RingHasher for Blake3Hasher {
    fn hash(&self, key: &str) -> u64 {
        let digest = blake3::hash(key.as_bytes());
        let bytes: [u8; 8] = digest.as_bytes()[..8].try_into().unwrap();
        u64::from_le_bytes(bytes)
    }
}

/// Alternate hasher kept for distribution benchmarking: SHA3-256 truncated
pub struct Sha3Hasher;

impl RingHasher for Sha3Hasher {
    fn hash(&self, key: &str) -> u64 {
        use sha3::{Digest, Sha3_256};
        let digest = Sha3_256::digest(key.as_bytes());
        let bytes: [u8; 8] = digest[..8].try_into().unwrap();
        u64::from_le_bytes(bytes)
    }
}

struct RingState<T> {
    /// hash(vnode name) -> node, ordered by position
    ring: BTreeMap<u64, T>,
    /// Positions owned by each node, for O(own vnodes) removal
    positions: HashMap<T, Vec<u64>>,
    weights: HashMap<T, usize>,
}

impl<T> Default for RingState<T> {
    fn default() -> Self {
        Self {
            ring: BTreeMap::new(),
            positions: HashMap::new(),
            weights: HashMap::new(),
        }
    }
}

/// Weighted consistent hash ring over nodes of type `T`
pub struct ConsistentHashRing<T> {
    state: RwLock<RingState<T>>,
    hasher: Box<dyn RingHasher>,
    vnodes_per_seed: usize,
    seeds: usize,
}

impl<T> ConsistentHashRing<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Create a ring with the default BLAKE3 hasher
    pub fn new(vnodes_per_seed: usize, seeds: usize) -> Self {
        Self::with_hasher(vnodes_per_seed, seeds, Box::new(Blake3Hasher))
    }

    /// Create a ring with a custom hash function
    pub fn with_hasher(vnodes_per_seed: usize, seeds: usize, hasher: Box<dyn RingHasher>) -> Self {
        Self {
            state: RwLock::new(RingState::default()),
            hasher,
            vnodes_per_seed,
            seeds,
        }
    }

    fn vnode_name(node: &T, seq: usize, seed: usize) -> String {
        format!("{}#{}@{}", node, seq, seed)
    }

    /// Add a node with weight 1
    pub fn add_node(&self, node: T) {
        self.add_weighted_node(node, 1);
    }

    /// Add a node, generating `vnodes_per_seed * seeds * weight` positions.
    ///
    /// An existing node is removed first, making this the weight-update path.
    pub fn add_weighted_node(&self, node: T, weight: usize) {
        if weight == 0 {
            return;
        }
        let mut state = self.state.write();
        if state.weights.contains_key(&node) {
            Self::remove_locked(&mut state, &node);
        }

        let mut positions = Vec::with_capacity(self.vnodes_per_seed * self.seeds * weight);
        for seed in 0..self.seeds {
            for seq in 0..self.vnodes_per_seed * weight {
                let hash = self.hasher.hash(&Self::vnode_name(&node, seq, seed));
                // First owner of a colliding position keeps it
                if !state.ring.contains_key(&hash) {
                    state.ring.insert(hash, node.clone());
                    positions.push(hash);
                }
            }
        }

        tracing::debug!(
            node = %node,
            weight,
            virtual_nodes = positions.len(),
            "added node to hash ring"
        );
        state.positions.insert(node.clone(), positions);
        state.weights.insert(node, weight);
    }

    /// Remove a node and all its virtual nodes
    pub fn remove_node(&self, node: &T) {
        let mut state = self.state.write();
        Self::remove_locked(&mut state, node);
    }

    fn remove_locked(state: &mut RingState<T>, node: &T) {
        if let Some(positions) = state.positions.remove(node) {
            for hash in positions {
                state.ring.remove(&hash);
            }
            state.weights.remove(node);
            tracing::debug!(node = %node, "removed node from hash ring");
        }
    }

    /// Drop every node
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.ring.clear();
        state.positions.clear();
        state.weights.clear();
    }

    /// Owning node for a key: smallest ring entry at or past `hash(key)`,
    /// wrapping to the first entry. `None` on an empty ring.
    pub fn get_node(&self, key: &str) -> Option<T> {
        let state = self.state.read();
        if state.ring.is_empty() {
            return None;
        }
        let hash = self.hasher.hash(key);
        state
            .ring
            .range(hash..)
            .next()
            .or_else(|| state.ring.iter().next())
            .map(|(_, node)| node.clone())
    }

    /// Up to `count` distinct nodes past a key's position (for replication).
    /// Returns every node when `count` covers the whole ring.
    pub fn get_nodes(&self, key: &str, count: usize) -> HashSet<T> {
        let state = self.state.read();
        if count >= state.weights.len() {
            return state.weights.keys().cloned().collect();
        }

        let hash = self.hasher.hash(key);
        let mut result = HashSet::with_capacity(count);
        for (_, node) in state.ring.range(hash..).chain(state.ring.range(..hash)) {
            result.insert(node.clone());
            if result.len() >= count {
                break;
            }
        }
        result
    }

    /// Whether `node` owns `key`
    pub fn is_responsible(&self, node: &T, key: &str) -> bool {
        self.get_node(key).as_ref() == Some(node)
    }

    /// All known nodes
    pub fn nodes(&self) -> HashSet<T> {
        self.state.read().weights.keys().cloned().collect()
    }

    /// Number of physical nodes
    pub fn node_count(&self) -> usize {
        self.state.read().weights.len()
    }

    /// Coefficient of variation of virtual-node counts per node.
    ///
    /// Diagnostics only; 0.0 means perfectly even, larger is more skewed.
    pub fn balance_metric(&self) -> f64 {
        let state = self.state.read();
        if state.weights.len() <= 1 {
            return 0.0;
        }

        let mut counts: HashMap<&T, usize> = HashMap::new();
        for node in state.ring.values() {
            *counts.entry(node).or_insert(0) += 1;
        }

        let n = counts.len() as f64;
        let mean = counts.values().sum::<usize>() as f64 / n;
        if mean == 0.0 {
            return 0.0;
        }
        let variance = counts
            .values()
            .map(|&c| (c as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        variance.sqrt() / mean
    }
}
