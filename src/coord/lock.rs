//! Non-blocking distributed lock
//!
//! One atomic set-if-absent round trip to acquire, one atomic
//! compare-token-then-delete to release. There is deliberately no retry or
//! blocking: failure to acquire means another instance is already doing the
//! protected work, and the caller returns early. A transport error on
//! acquire is also treated as failure, skipping the protected action rather
//! than risking double execution.

use crate::store::CoordinationStore;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Proof of lock ownership; required to release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    /// The raw owner token as stored
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Distributed mutual exclusion over the coordination store
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
}

impl DistributedLock {
    /// Create a lock helper over a store
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Try to acquire `key` for `ttl`. `None` means someone else holds it
    /// (or the store was unreachable, which callers must treat the same way).
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let token = Uuid::new_v4().to_string();
        match self.store.set_nx_px(key, &token, ttl).await {
            Ok(true) => Some(LockToken(token)),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "lock acquire failed, skipping protected action");
                None
            }
        }
    }

    /// Release `key` if `token` still owns it. Returns false when the lock
    /// expired and was reassigned; the new holder's token is left intact.
    pub async fn release(&self, key: &str, token: &LockToken) -> bool {
        match self.store.del_if_match(key, token.as_str()).await {
            Ok(released) => {
                if !released {
                    tracing::debug!(key, "lock already expired or reassigned");
                }
                released
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "lock release failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lock() -> DistributedLock {
        DistributedLock::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_second_acquire_fails() {
        let lock = lock();
        let ttl = Duration::from_secs(10);

        let token = lock.try_acquire("room:1", ttl).await;
        assert!(token.is_some());
        assert!(lock.try_acquire("room:1", ttl).await.is_none());
    }

    #[tokio::test]
    async fn test_release_then_reacquire() {
        let lock = lock();
        let ttl = Duration::from_secs(10);

        let token = lock.try_acquire("room:1", ttl).await.unwrap();
        assert!(lock.release("room:1", &token).await);
        assert!(lock.try_acquire("room:1", ttl).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_token_cannot_release_reassigned_lock() {
        let lock = lock();

        let stale = lock
            .try_acquire("room:1", Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Expired; a second caller takes over
        let fresh = lock
            .try_acquire("room:1", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!lock.release("room:1", &stale).await);
        assert!(lock.release("room:1", &fresh).await);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_admit_one() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                DistributedLock::new(store)
                    .try_acquire("contended", Duration::from_secs(10))
                    .await
                    .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
