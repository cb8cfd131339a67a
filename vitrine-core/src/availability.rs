use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vitrine_shared::{ProductReservation, UserIdentity};

use crate::manager::{ReservationManager, ReservationPolicy};
use crate::repository::ReservationStore;
use crate::ReservationResult;

/// Point-in-time answer for the cart-add button and reservation badges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    pub held_by_requester: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved_by_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Availability {
    pub fn free() -> Self {
        Self {
            available: true,
            held_by_requester: false,
            reserved_by_name: None,
            expires_at: None,
        }
    }

    /// Evaluates a record already passed through lazy expiry. The reported
    /// `expires_at` is the policy's hold deadline, grace included.
    pub fn evaluate(
        record: Option<&ProductReservation>,
        requester: &UserIdentity,
        policy: &ReservationPolicy,
    ) -> Self {
        match record {
            Some(record) if record.is_active() => {
                let mine = record.is_held_by(&requester.id);
                Self {
                    available: mine,
                    held_by_requester: mine,
                    reserved_by_name: Some(record.holder_name.clone()),
                    expires_at: Some(policy.held_until(record)),
                }
            }
            _ => Self::free(),
        }
    }
}

impl ReservationManager {
    /// Runs lazy expiry first, so a silently lapsed claim never reads as taken.
    pub async fn check_availability(
        &self,
        product_id: &str,
        requester: &UserIdentity,
    ) -> ReservationResult<Availability> {
        self.expire_if_lapsed(product_id).await?;
        let record = self.store().get(product_id).await?;
        Ok(Availability::evaluate(record.as_ref(), requester, self.policy()))
    }
}
