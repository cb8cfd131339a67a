use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::manager::ReservationManager;
use crate::repository::ReservationStore;
use crate::ReservationResult;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    /// Lapsed records some other writer transitioned first.
    pub lost_races: usize,
    pub failed: usize,
}

/// Periodically expires lapsed reservations nobody is looking at anymore.
///
/// Safe to run on every instance at once: each expiry is the same conditional
/// write the lazy path uses, so concurrent sweepers settle on one transition.
pub struct ExpirySweeper {
    manager: Arc<ReservationManager>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(manager: Arc<ReservationManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    pub async fn sweep_once(&self) -> ReservationResult<SweepReport> {
        let now = self.manager.now();
        let active = self.manager.store().list_active().await?;
        let mut report = SweepReport {
            scanned: active.len(),
            ..SweepReport::default()
        };

        for record in active.iter().filter(|r| self.manager.is_lapsed(r, now)) {
            match self.manager.expire_record(record).await {
                Ok(Some(_)) => report.expired += 1,
                Ok(None) => report.lost_races += 1,
                Err(e) => {
                    error!(product_id = %record.product_id, "Failed to expire reservation: {}", e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Expiry sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.expired > 0 || report.failed > 0 => {
                            info!(
                                scanned = report.scanned,
                                expired = report.expired,
                                lost_races = report.lost_races,
                                failed = report.failed,
                                "Expiry sweep finished"
                            );
                        }
                        Ok(_) => {}
                        // Retried on the next tick; claims keep expiring lazily meanwhile.
                        Err(e) => error!("Expiry sweep failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::manager::ReservationPolicy;
    use crate::memory::MemoryReservationStore;
    use crate::notifier::ChangeNotifier;
    use crate::repository::{CasOutcome, StoreError};
    use crate::ReservationError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use vitrine_shared::{ProductReservation, ReservationStatus, UserIdentity};

    /// Holds the first `released` write at the store until the test lets it
    /// through, so a sweep can be slotted in after the release has read.
    #[derive(Default)]
    struct ParkedRelease {
        inner: MemoryReservationStore,
        parked: AtomicBool,
        reached: Notify,
        proceed: Notify,
    }

    #[async_trait]
    impl ReservationStore for ParkedRelease {
        async fn get(&self, product_id: &str) -> Result<Option<ProductReservation>, StoreError> {
            self.inner.get(product_id).await
        }

        async fn conditional_put(
            &self,
            product_id: &str,
            record: &ProductReservation,
            expected: Option<&ProductReservation>,
        ) -> Result<CasOutcome, StoreError> {
            if record.status == ReservationStatus::Released && !self.parked.swap(true, Ordering::SeqCst) {
                self.reached.notify_one();
                self.proceed.notified().await;
            }
            self.inner.conditional_put(product_id, record, expected).await
        }

        async fn conditional_delete(
            &self,
            product_id: &str,
            expected: &ProductReservation,
        ) -> Result<CasOutcome, StoreError> {
            self.inner.conditional_delete(product_id, expected).await
        }

        async fn list_active(&self) -> Result<Vec<ProductReservation>, StoreError> {
            self.inner.list_active().await
        }
    }

    fn setup() -> (Arc<MemoryReservationStore>, Arc<ManualClock>, Arc<ReservationManager>) {
        let store = Arc::new(MemoryReservationStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = ReservationManager::new(
            store.clone(),
            Arc::new(ChangeNotifier::default()),
            ReservationPolicy::new(chrono::Duration::minutes(10), chrono::Duration::zero()).unwrap(),
        )
        .with_clock(clock.clone());
        (store, clock, Arc::new(manager))
    }

    fn user(n: usize) -> UserIdentity {
        UserIdentity::new(format!("u-{}", n), format!("User {}", n), format!("u{}@example.com", n))
    }

    #[tokio::test]
    async fn test_sweep_expires_only_lapsed() {
        let (store, clock, manager) = setup();
        manager.claim("P1", &user(1)).await.unwrap();
        manager.claim("P2", &user(2)).await.unwrap();
        clock.advance(chrono::Duration::minutes(6));
        manager.claim("P3", &user(3)).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));

        let sweeper = ExpirySweeper::new(manager.clone(), DEFAULT_SWEEP_INTERVAL);
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport { scanned: 3, expired: 2, lost_races: 0, failed: 0 });

        assert_eq!(store.get("P1").await.unwrap().unwrap().status, ReservationStatus::Expired);
        assert_eq!(store.get("P3").await.unwrap().unwrap().status, ReservationStatus::Active);

        // Idempotent.
        let again = sweeper.sweep_once().await.unwrap();
        assert_eq!(again.expired, 0);
        assert_eq!(again.scanned, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweepers_and_lazy_readers_converge() {
        let (store, clock, manager) = setup();
        manager.claim("P1", &user(1)).await.unwrap();
        clock.advance(chrono::Duration::minutes(20));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _handle = manager.notifier().subscribe_with("P1", move |event| {
            sink.lock().unwrap().push(event);
        });

        let mut sweeps = Vec::new();
        let mut lazies = Vec::new();
        for _ in 0..8 {
            let sweeper = ExpirySweeper::new(manager.clone(), DEFAULT_SWEEP_INTERVAL);
            sweeps.push(tokio::spawn(async move { sweeper.sweep_once().await }));
            let manager = manager.clone();
            lazies.push(tokio::spawn(async move { manager.expire_if_lapsed("P1").await }));
        }

        let mut transitions = 0;
        for sweep in sweeps {
            transitions += sweep.await.unwrap().unwrap().expired;
        }
        for lazy in lazies {
            if lazy.await.unwrap().unwrap().is_some() {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);

        let record = store.get("P1").await.unwrap().unwrap();
        assert_eq!(record.status, ReservationStatus::Expired);
        assert_eq!(record.revision, 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_release_racing_sweep_has_one_winner() {
        let store = Arc::new(ParkedRelease::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = Arc::new(
            ReservationManager::new(
                store.clone(),
                Arc::new(ChangeNotifier::default()),
                ReservationPolicy::new(chrono::Duration::minutes(10), chrono::Duration::zero()).unwrap(),
            )
            .with_clock(clock.clone()),
        );

        let claimed = manager.claim("P1", &user(1)).await.unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _handle = manager.notifier().subscribe_with("P1", move |event| {
            sink.lock().unwrap().push(event);
        });

        // The release reads a live claim, then stalls before its write.
        let releaser = manager.clone();
        let release = tokio::spawn(async move { releaser.release("P1", &user(1)).await });
        store.reached.notified().await;

        // Meanwhile the claim lapses and a sweep commits the expiry.
        clock.set(claimed.expires_at + chrono::Duration::milliseconds(1));
        let sweeper = ExpirySweeper::new(manager.clone(), DEFAULT_SWEEP_INTERVAL);
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.expired, 1);

        store.proceed.notify_one();
        assert!(matches!(
            release.await.unwrap(),
            Err(ReservationError::NotHolder { .. })
        ));

        let record = store.get("P1").await.unwrap().unwrap();
        assert_eq!(record.status, ReservationStatus::Expired);
        assert_eq!(record.revision, claimed.revision + 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = events.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, ReservationStatus::Expired);
    }

    #[tokio::test]
    async fn test_sweep_after_release_finds_nothing() {
        let (store, clock, manager) = setup();
        let claimed = manager.claim("P1", &user(1)).await.unwrap();
        let released = manager.release("P1", &user(1)).await.unwrap();

        clock.set(claimed.expires_at + chrono::Duration::minutes(1));
        let sweeper = ExpirySweeper::new(manager.clone(), DEFAULT_SWEEP_INTERVAL);
        assert_eq!(sweeper.sweep_once().await.unwrap(), SweepReport::default());
        assert_eq!(store.get("P1").await.unwrap().unwrap(), released);
    }

    #[tokio::test]
    async fn test_sweep_reports_store_outage() {
        let (store, _clock, manager) = setup();
        store.set_offline(true);
        let sweeper = ExpirySweeper::new(manager, DEFAULT_SWEEP_INTERVAL);
        assert!(matches!(
            sweeper.sweep_once().await,
            Err(ReservationError::StoreUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_until_shutdown() {
        let (store, clock, manager) = setup();
        manager.claim("P1", &user(1)).await.unwrap();
        clock.advance(chrono::Duration::minutes(11));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = ExpirySweeper::new(manager.clone(), Duration::from_secs(60));
        let task = tokio::spawn(sweeper.run(shutdown_rx));

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.get("P1").await.unwrap().unwrap().status, ReservationStatus::Expired);

        // An outage does not stop the loop.
        store.set_offline(true);
        tokio::time::sleep(Duration::from_secs(61)).await;
        store.set_offline(false);

        manager.claim("P2", &user(2)).await.unwrap();
        clock.advance(chrono::Duration::minutes(11));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.get("P2").await.unwrap().unwrap().status, ReservationStatus::Expired);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
