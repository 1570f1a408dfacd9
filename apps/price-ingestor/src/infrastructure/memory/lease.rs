use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::application::ports::{LeaseError, LeaseStorePort};
use crate::domain::leadership::LeaseRecord;

#[derive(Debug, Clone)]
struct Entry {
    owner: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Lease store with atomic create-if-absent semantics.
///
/// Expiry uses the tokio clock so tests can drive it with paused time.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryLeaseStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent operations fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LeaseError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LeaseError::ConnectionError {
                message: "lease store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStorePort for InMemoryLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        self.check()?;
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            Entry {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        self.check()?;
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(key) {
            Some(entry) if entry.owner == owner && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError> {
        self.check()?;
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|entry| entry.owner == owner) {
            leases.remove(key);
        }
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        self.check()?;
        let now = Instant::now();
        let leases = self.leases.lock();
        Ok(leases
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| {
                let remaining = entry.expires_at.saturating_duration_since(now);
                LeaseRecord {
                    owner_id: entry.owner.clone(),
                    expires_at: Utc::now()
                        + chrono::Duration::from_std(remaining).unwrap_or_default(),
                }
            }))
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    const TTL: Duration = Duration::from_secs(15);

    #[tokio::test(start_paused = true)]
    async fn only_one_owner_at_a_time() {
        let store = InMemoryLeaseStore::new();
        assert!(store.try_acquire("k", "a", TTL).await.unwrap());
        assert!(!store.try_acquire("k", "b", TTL).await.unwrap());
        assert_eq!(store.current("k").await.unwrap().unwrap().owner_id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_counts_as_absent() {
        let store = InMemoryLeaseStore::new();
        assert!(store.try_acquire("k", "a", TTL).await.unwrap());

        tokio::time::advance(TTL).await;
        assert!(store.current("k").await.unwrap().is_none());
        assert!(!store.renew("k", "a", TTL).await.unwrap());
        assert!(store.try_acquire("k", "b", TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_only_for_owner() {
        let store = InMemoryLeaseStore::new();
        store.try_acquire("k", "a", TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.renew("k", "a", TTL).await.unwrap());
        assert!(!store.renew("k", "b", TTL).await.unwrap());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.current("k").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_owner_guarded() {
        let store = InMemoryLeaseStore::new();
        store.try_acquire("k", "a", TTL).await.unwrap();

        assert_ok!(store.release("k", "b").await);
        assert!(store.current("k").await.unwrap().is_some());

        assert_ok!(store.release("k", "a").await);
        assert!(store.current("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = InMemoryLeaseStore::new();
        store.set_unavailable(true);
        let err = assert_err!(store.try_acquire("k", "a", TTL).await);
        assert!(matches!(err, LeaseError::ConnectionError { .. }));
        assert_err!(store.renew("k", "a", TTL).await);
    }
}
