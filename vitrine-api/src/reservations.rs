use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use uuid::Uuid;
use vitrine_core::{Availability, ReservationError};
use vitrine_shared::{ProductReservation, ReservationStatus, UserIdentity};

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

/// What a shopper sees of a reservation. The holder's email stays server side.
#[derive(Debug, Serialize)]
pub struct ReservationResponse {
    pub reservation_id: Uuid,
    pub product_id: String,
    pub holder_name: String,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ReservationStatus,
    pub revision: u64,
}

impl From<ProductReservation> for ReservationResponse {
    fn from(record: ProductReservation) -> Self {
        Self {
            reservation_id: record.id,
            product_id: record.product_id,
            holder_name: record.holder_name,
            reserved_at: record.reserved_at,
            expires_at: record.expires_at,
            status: record.status,
            revision: record.revision,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub status: &'static str,
    pub product_id: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/products/{product_id}/reservation",
            post(claim_reservation).delete(release_reservation),
        )
        .route("/v1/products/{product_id}/availability", get(check_availability))
        .route("/v1/products/{product_id}/reservation/events", get(watch_reservation))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/products/{product_id}/reservation
/// Claims the product for the caller, or renews the caller's own claim.
pub async fn claim_reservation(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path(product_id): Path<String>,
) -> Result<Json<ReservationResponse>, AppError> {
    match state.manager.claim(&product_id, &user).await {
        Ok(record) => {
            // A renewal keeps reserved_at, so its window outgrows one TTL.
            let outcome = if record.expires_at - record.reserved_at > state.manager.policy().ttl {
                "renewed"
            } else {
                "claimed"
            };
            state.metrics.claims.with_label_values(&[outcome]).inc();
            Ok(Json(record.into()))
        }
        Err(e) => {
            let outcome = match e {
                ReservationError::Conflict { .. } => "conflict",
                _ => "error",
            };
            state.metrics.claims.with_label_values(&[outcome]).inc();
            Err(e.into())
        }
    }
}

/// DELETE /v1/products/{product_id}/reservation
/// Releasing something the caller does not hold is a no-op, not an error.
pub async fn release_reservation(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path(product_id): Path<String>,
) -> Result<Json<ReleaseResponse>, AppError> {
    let status = match state.manager.release(&product_id, &user).await {
        Ok(_) => "released",
        Err(ReservationError::NotHolder { .. }) => "not_holder",
        Err(e) => {
            state.metrics.releases.with_label_values(&["error"]).inc();
            return Err(e.into());
        }
    };
    state.metrics.releases.with_label_values(&[status]).inc();

    Ok(Json(ReleaseResponse { status, product_id }))
}

/// GET /v1/products/{product_id}/availability
pub async fn check_availability(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path(product_id): Path<String>,
) -> Result<Json<Availability>, AppError> {
    state.metrics.availability_checks.inc();
    let availability = state.manager.check_availability(&product_id, &user).await?;
    Ok(Json(availability))
}

/// GET /v1/products/{product_id}/reservation/events
/// Server-sent events; the first event is the current state when one exists.
pub async fn watch_reservation(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path(product_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let subscription = state.manager.subscribe(&product_id).await?;
    state.metrics.watch_streams.inc();
    tracing::debug!(product_id = %product_id, user = %user.id, "Reservation stream opened");

    let stream = subscription
        .into_stream()
        .map(|event| Event::default().event("reservation").json_data(event));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
