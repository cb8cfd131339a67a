use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::reservation::{ProductReservation, ReservationStatus};

/// Pushed to every watcher of a product after a reservation write commits.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct ReservationEvent {
    pub product_id: String,
    pub reservation_id: Uuid,
    pub status: ReservationStatus,
    pub holder_name: String,
    /// `None` once the reservation is no longer active.
    pub expires_at: Option<DateTime<Utc>>,
    pub revision: u64,
    pub occurred_at: DateTime<Utc>,
}

impl ReservationEvent {
    pub fn from_record(record: &ProductReservation, occurred_at: DateTime<Utc>) -> Self {
        Self {
            product_id: record.product_id.clone(),
            reservation_id: record.id,
            status: record.status,
            holder_name: record.holder_name.clone(),
            expires_at: record.is_active().then_some(record.expires_at),
            revision: record.revision,
            occurred_at,
        }
    }
}
