use async_trait::async_trait;
use vitrine_shared::ProductReservation;

/// Result of a conditional store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The stored record did not match the expectation; `current` is what is there now.
    Conflict { current: Option<ProductReservation> },
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Stored reservation for product {product_id} is unreadable: {reason}")]
    Corrupt { product_id: String, reason: String },
}

/// Keyed storage holding at most one reservation record per product.
///
/// Every mutation replaces the whole record and is conditional on the record
/// currently stored, compared by `(id, revision)`. `expected = None` means
/// "only if nothing is stored for this product".
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn get(&self, product_id: &str) -> Result<Option<ProductReservation>, StoreError>;

    async fn conditional_put(
        &self,
        product_id: &str,
        record: &ProductReservation,
        expected: Option<&ProductReservation>,
    ) -> Result<CasOutcome, StoreError>;

    async fn conditional_delete(
        &self,
        product_id: &str,
        expected: &ProductReservation,
    ) -> Result<CasOutcome, StoreError>;

    /// Every record whose status is `active`, lapsed or not.
    async fn list_active(&self) -> Result<Vec<ProductReservation>, StoreError>;
}

/// Shared matching rule for store implementations.
pub fn matches_expected(
    stored: Option<&ProductReservation>,
    expected: Option<&ProductReservation>,
) -> bool {
    match (stored, expected) {
        (None, None) => true,
        (Some(stored), Some(expected)) => stored.same_version(expected),
        _ => false,
    }
}
