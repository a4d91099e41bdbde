//! Cross-instance coordination primitives
//!
//! Built entirely on atomic coordination-store operations: a non-blocking
//! distributed lock and the idle/used resource ID pool that mints broker
//! resource names.

pub mod lock;
pub mod pool;

pub use lock::{DistributedLock, LockToken};
pub use pool::{ResourceIdPool, ResourceKind, SharingClass};
