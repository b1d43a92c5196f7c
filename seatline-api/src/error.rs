use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use seatline_booking::{BookingError, GatewayError};
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    ValidationError(String),
    NotFoundError(String),
    /// Typed conflict outcome; `code` lets clients branch without parsing text.
    ConflictError { code: &'static str, message: String },
    SignatureError(String),
    ServiceUnavailable(String),
    Anyhow(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, error_message) = match self {
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "VALIDATION", msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            AppError::ConflictError { code, message } => (StatusCode::CONFLICT, code, message),
            AppError::SignatureError(msg) => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", msg),
            AppError::ServiceUnavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORE_UNAVAILABLE",
                    "Seat reservations are temporarily unavailable".to_string(),
                )
            }
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::Validation(msg) => AppError::ValidationError(msg),
            BookingError::NotFound(id) => AppError::NotFoundError(format!("Booking not found: {}", id)),
            e @ BookingError::SeatLocked(_) => AppError::ConflictError {
                code: "SEAT_LOCKED",
                message: e.to_string(),
            },
            e @ BookingError::SeatConflict(_) => AppError::ConflictError {
                code: "SEAT_CONFLICT",
                message: e.to_string(),
            },
            e @ BookingError::InvalidStatus { .. } => AppError::ConflictError {
                code: "INVALID_STATUS",
                message: e.to_string(),
            },
            e @ BookingError::ConcurrentUpdate(_) => AppError::ConflictError {
                code: "CONCURRENT_UPDATE",
                message: e.to_string(),
            },
            BookingError::StoreUnavailable(e) => AppError::ServiceUnavailable(e.to_string()),
            BookingError::Gateway(e @ (GatewayError::MissingHash | GatewayError::HashMismatch)) => {
                AppError::SignatureError(e.to_string())
            }
            BookingError::Gateway(GatewayError::InvalidAmount(amount)) => {
                AppError::ValidationError(format!("Invalid payment amount: {}", amount))
            }
            other => AppError::Anyhow(other.into()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Anyhow(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seatline_core::{BookingStatus, LockError};
    use std::time::Duration;

    fn status_of(err: BookingError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_booking_errors_map_to_http_statuses() {
        assert_eq!(status_of(BookingError::SeatLocked("A1".into())), StatusCode::CONFLICT);
        assert_eq!(status_of(BookingError::SeatConflict(vec!["A1".into()])), StatusCode::CONFLICT);
        assert_eq!(status_of(BookingError::NotFound("abc123".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(BookingError::InvalidStatus {
                booking_id: "abc123".into(),
                from: BookingStatus::Late,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(BookingError::StoreUnavailable(LockError::Timeout(Duration::from_millis(500)))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_of(BookingError::Gateway(GatewayError::HashMismatch)), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(BookingError::Validation("bad".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(BookingError::ConcurrentUpdate("abc123".into())), StatusCode::CONFLICT);
    }
}
