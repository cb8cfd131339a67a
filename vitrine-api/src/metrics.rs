use axum::{extract::State, http::{header, StatusCode}, response::IntoResponse};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use vitrine_core::EventRelay;
use vitrine_shared::{ReservationEvent, ReservationStatus};

use crate::state::AppState;

/// Counters for the reservation entry points, exported on `/metrics`.
pub struct ReservationMetrics {
    registry: Registry,
    pub claims: IntCounterVec,
    pub releases: IntCounterVec,
    pub availability_checks: IntCounter,
    pub watch_streams: IntCounter,
    pub expirations: IntCounter,
}

impl ReservationMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let claims = IntCounterVec::new(
            Opts::new("vitrine_claims_total", "Reservation claim attempts by outcome"),
            &["outcome"],
        )?;
        let releases = IntCounterVec::new(
            Opts::new("vitrine_releases_total", "Reservation release attempts by outcome"),
            &["outcome"],
        )?;
        let availability_checks = IntCounter::new(
            "vitrine_availability_checks_total",
            "Availability queries served",
        )?;
        let watch_streams = IntCounter::new(
            "vitrine_watch_streams_total",
            "Reservation event streams opened",
        )?;

        let expirations = IntCounter::new(
            "vitrine_expirations_total",
            "Reservations expired by this instance",
        )?;

        registry.register(Box::new(claims.clone()))?;
        registry.register(Box::new(releases.clone()))?;
        registry.register(Box::new(availability_checks.clone()))?;
        registry.register(Box::new(watch_streams.clone()))?;
        registry.register(Box::new(expirations.clone()))?;

        Ok(Self {
            registry,
            claims,
            releases,
            availability_checks,
            watch_streams,
            expirations,
        })
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Sits in the manager's relay slot: counts expirations this instance
/// applied, then hands the event on (to Kafka, when configured).
pub struct MeteredRelay {
    metrics: Arc<ReservationMetrics>,
    downstream: Option<Arc<dyn EventRelay>>,
}

impl MeteredRelay {
    pub fn new(metrics: Arc<ReservationMetrics>, downstream: Option<Arc<dyn EventRelay>>) -> Self {
        Self { metrics, downstream }
    }
}

impl EventRelay for MeteredRelay {
    fn relay(&self, event: &ReservationEvent) {
        if event.status == ReservationStatus::Expired {
            self.metrics.expirations.inc();
        }
        if let Some(downstream) = &self.downstream {
            downstream.relay(event);
        }
    }
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = ReservationMetrics::new().unwrap();
        metrics.claims.with_label_values(&["conflict"]).inc();
        metrics.availability_checks.inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("vitrine_claims_total{outcome=\"conflict\"} 1"));
        assert!(text.contains("vitrine_availability_checks_total 1"));
    }

    #[test]
    fn test_metered_relay_counts_expirations_and_forwards() {
        use chrono::{Duration, Utc};
        use std::sync::Mutex;
        use vitrine_shared::{ProductReservation, UserIdentity};

        #[derive(Default)]
        struct Capture(Mutex<Vec<u64>>);
        impl EventRelay for Capture {
            fn relay(&self, event: &ReservationEvent) {
                self.0.lock().unwrap().push(event.revision);
            }
        }

        let metrics = Arc::new(ReservationMetrics::new().unwrap());
        let capture = Arc::new(Capture::default());
        let relay = MeteredRelay::new(metrics.clone(), Some(capture.clone()));

        let user = UserIdentity::new("u-1", "Alice", "alice@example.com");
        let now = Utc::now();
        let claimed = ProductReservation::claim("p-1", &user, now, Duration::minutes(10), None);
        let expired = claimed.transitioned(ReservationStatus::Expired);

        relay.relay(&ReservationEvent::from_record(&claimed, now));
        relay.relay(&ReservationEvent::from_record(&expired, now));

        assert_eq!(metrics.expirations.get(), 1);
        assert_eq!(*capture.0.lock().unwrap(), vec![1, 2]);
    }
}
