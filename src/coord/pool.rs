//! Resource ID pool
//!
//! The only place broker exchange/queue identifiers are minted. IDs live in
//! exactly one of two store sets per `(kind, sharing class)` scope: `idle`
//! (reusable) or `used` (bound to a room). Acquisition pops an idle ID or
//! mints a fresh one from a counter; release moves used back to idle. Both
//! run as single atomic store operations, so concurrent instances can never
//! double-allocate a name, and churn reuses names instead of growing the
//! broker's object count without bound.

use crate::core::error::StoreError;
use crate::store::CoordinationStore;
use std::fmt;
use std::sync::Arc;

/// Kind of broker resource an ID names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// AMQP exchange
    Exchange,
    /// AMQP queue
    Queue,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Exchange => write!(f, "exchange"),
            ResourceKind::Queue => write!(f, "queue"),
        }
    }
}

/// Tier-derived sharing class scoping a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharingClass {
    /// One resource serves many cold rooms
    Shared,
    /// Resource belongs to a single room
    Dedicated,
}

impl fmt::Display for SharingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharingClass::Shared => write!(f, "shared"),
            SharingClass::Dedicated => write!(f, "dedicated"),
        }
    }
}

/// Idle/used ID allocator over the coordination store
pub struct ResourceIdPool {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
}

impl ResourceIdPool {
    /// Create a pool rooted at `prefix` in the store keyspace
    pub fn new(store: Arc<dyn CoordinationStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn idle_key(&self, kind: ResourceKind, class: SharingClass) -> String {
        format!("{}:{}:idle:{}", self.prefix, kind, class)
    }

    fn used_key(&self, kind: ResourceKind, class: SharingClass) -> String {
        format!("{}:{}:used:{}", self.prefix, kind, class)
    }

    /// Acquire an ID in the given scope, reusing an idle one when possible
    pub async fn acquire(
        &self,
        kind: ResourceKind,
        class: SharingClass,
    ) -> Result<String, StoreError> {
        let idle = self.idle_key(kind, class);
        let used = self.used_key(kind, class);
        let counter = format!("{}:counter", idle);

        let id = self.store.pool_acquire(&idle, &used, &counter).await?;
        tracing::debug!(%kind, %class, id, "acquired resource id");
        Ok(id)
    }

    /// Release an ID back to the idle set. Returns false when the ID was not
    /// in use (already released, or never minted here).
    pub async fn release(
        &self,
        kind: ResourceKind,
        class: SharingClass,
        id: &str,
    ) -> Result<bool, StoreError> {
        let idle = self.idle_key(kind, class);
        let used = self.used_key(kind, class);

        let released = self.store.pool_release(&used, &idle, id).await?;
        if released {
            tracing::debug!(%kind, %class, id, "released resource id");
        } else {
            tracing::warn!(%kind, %class, id, "release of unknown resource id ignored");
        }
        Ok(released)
    }
}
