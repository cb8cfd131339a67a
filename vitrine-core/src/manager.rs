//! Reservation lifecycle: claim, renew, release and expire.
//!
//! Every transition is a single conditional write against the store. Losing a
//! write race is never an error by itself: the manager re-reads and decides
//! again from what actually got committed. Only the writer whose conditional
//! write applied publishes the resulting event.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};
use vitrine_shared::{ProductReservation, ReservationEvent, ReservationStatus, UserIdentity};

use crate::clock::{Clock, SystemClock};
use crate::notifier::{ChangeNotifier, ReservationSubscription};
use crate::relay::EventRelay;
use crate::repository::{CasOutcome, ReservationStore};
use crate::{ReservationError, ReservationResult};

/// Upper bound on re-reads after losing a conditional write.
pub const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationPolicy {
    /// Lifetime of an unrenewed claim.
    pub ttl: Duration,
    /// Extra time an active record is honoured past `expires_at`, absorbing
    /// clock differences between instances sharing a store.
    pub clock_skew_grace: Duration,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("Reservation TTL must be positive, got {0}")]
    NonPositiveTtl(Duration),
    #[error("Clock skew grace must not be negative, got {0}")]
    NegativeGrace(Duration),
}

impl ReservationPolicy {
    /// A zero TTL would write claims that lapse the instant they land.
    pub fn new(ttl: Duration, clock_skew_grace: Duration) -> Result<Self, PolicyError> {
        if ttl <= Duration::zero() {
            return Err(PolicyError::NonPositiveTtl(ttl));
        }
        if clock_skew_grace < Duration::zero() {
            return Err(PolicyError::NegativeGrace(clock_skew_grace));
        }
        Ok(Self {
            ttl,
            clock_skew_grace,
        })
    }

    /// Last instant `record` still counts as held. This is the deadline
    /// shoppers are shown, so it includes the grace.
    pub fn held_until(&self, record: &ProductReservation) -> DateTime<Utc> {
        record.expires_at + self.clock_skew_grace
    }
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(10),
            clock_skew_grace: Duration::seconds(5),
        }
    }
}

pub struct ReservationManager {
    store: Arc<dyn ReservationStore>,
    notifier: Arc<ChangeNotifier>,
    clock: Arc<dyn Clock>,
    relay: Option<Arc<dyn EventRelay>>,
    policy: ReservationPolicy,
}

impl ReservationManager {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        notifier: Arc<ChangeNotifier>,
        policy: ReservationPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            clock: Arc::new(SystemClock),
            relay: None,
            policy,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_relay(mut self, relay: Arc<dyn EventRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn policy(&self) -> &ReservationPolicy {
        &self.policy
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub(crate) fn store(&self) -> &Arc<dyn ReservationStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Claim `product_id` for `user`, or renew the claim if `user` already holds it.
    pub async fn claim(
        &self,
        product_id: &str,
        user: &UserIdentity,
    ) -> ReservationResult<ProductReservation> {
        let mut current = self.store.get(product_id).await?;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now = self.clock.now();

            let lapsed = current
                .as_ref()
                .filter(|record| record.is_active() && self.is_lapsed(record, now))
                .cloned();
            if let Some(lapsed) = lapsed {
                // Lost the expiry to another writer: read what it committed.
                current = match self.expire_record(&lapsed).await? {
                    Some(expired) => Some(expired),
                    None => self.store.get(product_id).await?,
                };
                continue;
            }

            let next = match &current {
                Some(record) if record.is_active() && !record.is_held_by(&user.id) => {
                    debug!(product_id, holder = %record.holder_user_id, "Claim refused, product held");
                    return Err(ReservationError::Conflict {
                        product_id: product_id.to_string(),
                        holder_name: record.holder_name.clone(),
                        expires_at: self.policy.held_until(record),
                    });
                }
                Some(record) if record.is_active() => record.renewed(now, self.policy.ttl),
                _ => ProductReservation::claim(
                    product_id,
                    user,
                    now,
                    self.policy.ttl,
                    current.as_ref(),
                ),
            };

            match self
                .store
                .conditional_put(product_id, &next, current.as_ref())
                .await?
            {
                CasOutcome::Applied => {
                    let renewal = current.as_ref().is_some_and(|c| c.id == next.id);
                    info!(
                        product_id,
                        reservation_id = %next.id,
                        holder = %user.id,
                        expires_at = %next.expires_at,
                        renewal,
                        "Reservation claimed"
                    );
                    self.publish(&next);
                    return Ok(next);
                }
                CasOutcome::Conflict { current: latest } => {
                    debug!(product_id, attempt, "Claim lost a write race, re-evaluating");
                    current = latest;
                }
            }
        }

        Err(ReservationError::Contention {
            product_id: product_id.to_string(),
        })
    }

    /// Release `user`'s active claim. Anything else is `NotHolder`.
    pub async fn release(
        &self,
        product_id: &str,
        user: &UserIdentity,
    ) -> ReservationResult<ProductReservation> {
        let mut current = self.store.get(product_id).await?;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let record = match current {
                Some(record) if record.is_active() && record.is_held_by(&user.id) => record,
                _ => return Err(self.not_holder(product_id)),
            };

            if self.is_lapsed(&record, now) {
                // The claim is gone even though nobody recorded it yet.
                self.expire_record(&record).await?;
                return Err(self.not_holder(product_id));
            }

            let released = record.transitioned(ReservationStatus::Released);
            match self
                .store
                .conditional_put(product_id, &released, Some(&record))
                .await?
            {
                CasOutcome::Applied => {
                    info!(product_id, reservation_id = %released.id, holder = %user.id, "Reservation released");
                    self.publish(&released);
                    return Ok(released);
                }
                CasOutcome::Conflict { current: latest } => {
                    debug!(product_id, attempt, "Release lost a write race, re-evaluating");
                    current = latest;
                }
            }
        }

        Err(ReservationError::Contention {
            product_id: product_id.to_string(),
        })
    }

    /// Lazy expiry. Returns the expired record only to the caller whose write applied.
    pub async fn expire_if_lapsed(
        &self,
        product_id: &str,
    ) -> ReservationResult<Option<ProductReservation>> {
        let now = self.clock.now();
        match self.store.get(product_id).await? {
            Some(record) if record.is_active() && self.is_lapsed(&record, now) => {
                self.expire_record(&record).await
            }
            _ => Ok(None),
        }
    }

    /// `active → expired` on exactly the observed record. Shared by the lazy
    /// path and the sweeper; `None` means another writer got there first.
    pub async fn expire_record(
        &self,
        record: &ProductReservation,
    ) -> ReservationResult<Option<ProductReservation>> {
        if record.status.is_terminal() {
            return Ok(None);
        }

        let expired = record.transitioned(ReservationStatus::Expired);
        match self
            .store
            .conditional_put(&record.product_id, &expired, Some(record))
            .await?
        {
            CasOutcome::Applied => {
                info!(
                    product_id = %expired.product_id,
                    reservation_id = %expired.id,
                    holder = %expired.holder_user_id,
                    "Reservation expired"
                );
                self.publish(&expired);
                Ok(Some(expired))
            }
            CasOutcome::Conflict { .. } => {
                debug!(product_id = %record.product_id, "Expiry already applied elsewhere");
                Ok(None)
            }
        }
    }

    /// Subscribes to `product_id` and primes the subscription with the
    /// current state, lapsed claims expired first.
    pub async fn subscribe(&self, product_id: &str) -> ReservationResult<ReservationSubscription> {
        let mut subscription = self.notifier.subscribe(product_id);
        self.expire_if_lapsed(product_id).await?;
        if let Some(record) = self.store.get(product_id).await? {
            subscription.prime(ReservationEvent::from_record(&record, self.clock.now()));
        }
        Ok(subscription)
    }

    /// Whether an active record should be treated as gone at `now`.
    pub(crate) fn is_lapsed(&self, record: &ProductReservation, now: DateTime<Utc>) -> bool {
        if !record.has_valid_window() {
            error!(
                product_id = %record.product_id,
                reservation_id = %record.id,
                reserved_at = %record.reserved_at,
                expires_at = %record.expires_at,
                "Reservation window is invalid, treating as expired"
            );
            return true;
        }
        now > self.policy.held_until(record)
    }

    fn not_holder(&self, product_id: &str) -> ReservationError {
        ReservationError::NotHolder {
            product_id: product_id.to_string(),
        }
    }

    fn publish(&self, record: &ProductReservation) {
        let event = ReservationEvent::from_record(record, self.clock.now());
        if let Some(relay) = &self.relay {
            relay.relay(&event);
        }
        self.notifier.publish(event);
    }
}
