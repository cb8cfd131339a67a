use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use vitrine_shared::ProductReservation;

use crate::repository::{matches_expected, CasOutcome, ReservationStore, StoreError};

/// Process-local reservation store. Conditional writes are serialized by one
/// mutex, which is all single-node deployments and tests need.
#[derive(Debug, Default)]
pub struct MemoryReservationStore {
    records: Mutex<HashMap<String, ProductReservation>>,
    offline: AtomicBool,
}

impl MemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProductReservation>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for MemoryReservationStore {
    async fn get(&self, product_id: &str) -> Result<Option<ProductReservation>, StoreError> {
        self.check_online()?;
        Ok(self.lock().get(product_id).cloned())
    }

    async fn conditional_put(
        &self,
        product_id: &str,
        record: &ProductReservation,
        expected: Option<&ProductReservation>,
    ) -> Result<CasOutcome, StoreError> {
        self.check_online()?;
        let mut records = self.lock();
        let stored = records.get(product_id);
        if !matches_expected(stored, expected) {
            return Ok(CasOutcome::Conflict {
                current: stored.cloned(),
            });
        }
        records.insert(product_id.to_string(), record.clone());
        Ok(CasOutcome::Applied)
    }

    async fn conditional_delete(
        &self,
        product_id: &str,
        expected: &ProductReservation,
    ) -> Result<CasOutcome, StoreError> {
        self.check_online()?;
        let mut records = self.lock();
        let stored = records.get(product_id);
        if !matches_expected(stored, Some(expected)) {
            return Ok(CasOutcome::Conflict {
                current: stored.cloned(),
            });
        }
        records.remove(product_id);
        Ok(CasOutcome::Applied)
    }

    async fn list_active(&self) -> Result<Vec<ProductReservation>, StoreError> {
        self.check_online()?;
        Ok(self
            .lock()
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use vitrine_shared::{ReservationStatus, UserIdentity};

    fn record(previous: Option<&ProductReservation>) -> ProductReservation {
        let user = UserIdentity::new("u-1", "Alice", "alice@example.com");
        ProductReservation::claim("p-1", &user, Utc::now(), Duration::minutes(10), previous)
    }

    #[tokio::test]
    async fn test_put_requires_absence() {
        let store = MemoryReservationStore::new();
        let first = record(None);

        assert_eq!(store.conditional_put("p-1", &first, None).await.unwrap(), CasOutcome::Applied);

        // A second blind insert loses and is shown the winner.
        let second = record(None);
        match store.conditional_put("p-1", &second, None).await.unwrap() {
            CasOutcome::Conflict { current } => assert_eq!(current, Some(first.clone())),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(store.get("p-1").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_put_compares_revision() {
        let store = MemoryReservationStore::new();
        let first = record(None);
        store.conditional_put("p-1", &first, None).await.unwrap();

        let released = first.transitioned(ReservationStatus::Released);
        assert!(store.conditional_put("p-1", &released, Some(&first)).await.unwrap().is_applied());

        // Stale expectation: still pointing at the pre-release revision.
        let expired = first.transitioned(ReservationStatus::Expired);
        assert!(!store.conditional_put("p-1", &expired, Some(&first)).await.unwrap().is_applied());
        assert_eq!(store.get("p-1").await.unwrap().unwrap().status, ReservationStatus::Released);
        assert!(store.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let store = MemoryReservationStore::new();
        let first = record(None);
        store.conditional_put("p-1", &first, None).await.unwrap();

        let renewed = first.renewed(Utc::now(), Duration::minutes(10));
        store.conditional_put("p-1", &renewed, Some(&first)).await.unwrap();

        assert!(!store.conditional_delete("p-1", &first).await.unwrap().is_applied());
        assert!(store.conditional_delete("p-1", &renewed).await.unwrap().is_applied());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_offline_store_errors() {
        let store = MemoryReservationStore::new();
        store.set_offline(true);
        assert!(matches!(store.get("p-1").await, Err(StoreError::Unavailable(_))));
        store.set_offline(false);
        assert!(store.get("p-1").await.unwrap().is_none());
    }
}
