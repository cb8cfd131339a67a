use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::pii::Masked;

/// Identity of a shopper as handed over by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    pub email: Masked<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: Masked::new(email.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ReservationStatus::Active),
            "released" => Some(ReservationStatus::Released),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single record kept per product.
///
/// `revision` counts every write ever applied to the product's slot, across
/// successive reservations. Stores compare `(id, revision)` for their
/// conditional writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductReservation {
    pub id: Uuid,
    pub product_id: String,
    pub holder_user_id: String,
    pub holder_name: String,
    pub holder_email: Masked<String>,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ReservationStatus,
    pub revision: u64,
}

impl ProductReservation {
    /// Fresh active claim. `previous` is whatever currently occupies the slot.
    pub fn claim(
        product_id: impl Into<String>,
        holder: &UserIdentity,
        now: DateTime<Utc>,
        ttl: Duration,
        previous: Option<&ProductReservation>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id: product_id.into(),
            holder_user_id: holder.id.clone(),
            holder_name: holder.name.clone(),
            holder_email: holder.email.clone(),
            reserved_at: now,
            expires_at: now + ttl,
            status: ReservationStatus::Active,
            revision: previous.map_or(1, |p| p.revision + 1),
        }
    }

    /// Renewal keeps the id and `reserved_at`; `expires_at` always moves forward.
    pub fn renewed(&self, now: DateTime<Utc>, ttl: Duration) -> Self {
        let extended = now + ttl;
        let floor = self.expires_at + Duration::milliseconds(1);
        Self {
            expires_at: extended.max(floor),
            revision: self.revision + 1,
            ..self.clone()
        }
    }

    /// Copy of this record moved to a terminal status.
    pub fn transitioned(&self, status: ReservationStatus) -> Self {
        Self {
            status,
            revision: self.revision + 1,
            ..self.clone()
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    pub fn is_held_by(&self, user_id: &str) -> bool {
        self.holder_user_id == user_id
    }

    /// `expires_at > reserved_at`.
    pub fn has_valid_window(&self) -> bool {
        self.expires_at > self.reserved_at
    }

    /// Same slot version: what stores compare for conditional writes.
    pub fn same_version(&self, other: &ProductReservation) -> bool {
        self.id == other.id && self.revision == other.revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserIdentity {
        UserIdentity::new("u-alice", "Alice", "alice@example.com")
    }

    #[test]
    fn test_claim_sets_window_and_revision() {
        let now = Utc::now();
        let record = ProductReservation::claim("p-1", &alice(), now, Duration::minutes(10), None);

        assert_eq!(record.revision, 1);
        assert_eq!(record.expires_at - record.reserved_at, Duration::minutes(10));
        assert!(record.is_active());
        assert!(record.is_held_by("u-alice"));

        let next = ProductReservation::claim("p-1", &alice(), now, Duration::minutes(10), Some(&record));
        assert_eq!(next.revision, 2);
        assert_ne!(next.id, record.id);
    }

    #[test]
    fn test_renewal_strictly_extends() {
        let now = Utc::now();
        let record = ProductReservation::claim("p-1", &alice(), now, Duration::minutes(10), None);

        // Same instant: still moves forward.
        let renewed = record.renewed(now, Duration::minutes(10));
        assert!(renewed.expires_at > record.expires_at);
        assert_eq!(renewed.id, record.id);
        assert_eq!(renewed.reserved_at, record.reserved_at);
        assert_eq!(renewed.revision, record.revision + 1);
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&ReservationStatus::Expired).unwrap();
        assert_eq!(json, "\"expired\"");
        assert_eq!(ReservationStatus::parse("released"), Some(ReservationStatus::Released));
        assert_eq!(ReservationStatus::parse("gone"), None);
        assert!(ReservationStatus::Released.is_terminal());
    }
}
