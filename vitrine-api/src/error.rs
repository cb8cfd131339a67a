use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use vitrine_core::ReservationError;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    Anyhow(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Anyhow(err) => match err.downcast::<ReservationError>() {
                Ok(reservation_error) => return reservation_response(reservation_error),
                Err(err) => {
                    tracing::error!("Internal Server Error: {}", err);
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
                }
            },
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Conflicts carry who holds the product; every other failure reads as
/// "try again" and never as availability.
fn reservation_response(err: ReservationError) -> Response {
    match err {
        ReservationError::Conflict {
            product_id,
            holder_name,
            expires_at,
        } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "conflict",
                "product_id": product_id,
                "holder_name": holder_name,
                "expires_at": expires_at,
            })),
        )
            .into_response(),
        ReservationError::NotHolder { product_id } => (
            StatusCode::OK,
            Json(json!({
                "status": "not_holder",
                "product_id": product_id,
            })),
        )
            .into_response(),
        err @ (ReservationError::StoreUnavailable(_) | ReservationError::Contention { .. }) => {
            tracing::warn!("Transient reservation failure: {}", err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, "1")],
                Json(json!({ "error": "try_again" })),
            )
                .into_response()
        }
        err @ ReservationError::InvalidState { .. } => {
            tracing::error!("Reservation invariant violated: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "try_again" })),
            )
                .into_response()
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Anyhow(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_reservation_errors_map_to_statuses() {
        let conflict: AppError = ReservationError::Conflict {
            product_id: "P1".to_string(),
            holder_name: "Alice".to_string(),
            expires_at: Utc::now(),
        }
        .into();
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);

        let outage: AppError = ReservationError::StoreUnavailable("down".to_string()).into();
        let response = outage.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");

        let not_holder: AppError = ReservationError::NotHolder { product_id: "P1".to_string() }.into();
        assert_eq!(not_holder.into_response().status(), StatusCode::OK);

        let unauthenticated = AppError::AuthenticationError("Missing credentials".to_string());
        assert_eq!(unauthenticated.into_response().status(), StatusCode::UNAUTHORIZED);

        let other: AppError = anyhow::anyhow!("boom").into();
        assert_eq!(other.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
