pub mod availability;
pub mod clock;
pub mod identity;
pub mod manager;
pub mod memory;
pub mod notifier;
pub mod relay;
pub mod repository;
pub mod sweeper;

pub use availability::Availability;
pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{PolicyError, ReservationManager, ReservationPolicy};
pub use memory::MemoryReservationStore;
pub use notifier::{ChangeNotifier, ReservationSubscription, SubscriptionHandle};
pub use relay::EventRelay;
pub use repository::{CasOutcome, ReservationStore, StoreError};
pub use sweeper::{ExpirySweeper, SweepReport};

use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("Product {product_id} is reserved by {holder_name} until {expires_at}")]
    Conflict {
        product_id: String,
        holder_name: String,
        expires_at: DateTime<Utc>,
    },
    #[error("Caller does not hold a reservation on product {product_id}")]
    NotHolder { product_id: String },
    #[error("Reservation store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Concurrent writes kept winning on product {product_id}")]
    Contention { product_id: String },
    #[error("Invalid reservation state for product {product_id}: {reason}")]
    InvalidState { product_id: String, reason: String },
}

impl ReservationError {
    /// Errors the caller may retry (with backoff). Conflicts are deliberately excluded.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReservationError::StoreUnavailable(_) | ReservationError::Contention { .. }
        )
    }
}

impl From<StoreError> for ReservationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ReservationError::StoreUnavailable(msg),
            StoreError::Corrupt { product_id, reason } => {
                ReservationError::InvalidState { product_id, reason }
            }
        }
    }
}

pub type ReservationResult<T> = Result<T, ReservationError>;
