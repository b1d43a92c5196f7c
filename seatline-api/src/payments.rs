use axum::{
    extract::{Form, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use seatline_booking::{BookingError, CallbackFlow, CallbackOutcome};
use seatline_core::{BookingId, Payment};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/payment/return", get(payment_return))
        .route("/api/payment/ipn", post(payment_ipn))
        .route("/api/payment/booking/{id}", get(get_payment))
        .route("/api/payment/{id}", get(get_payment_by_id))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub success: bool,
    pub booking_id: String,
    pub status: String,
    pub message: String,
}

impl From<CallbackOutcome> for CallbackResponse {
    fn from(outcome: CallbackOutcome) -> Self {
        match outcome {
            CallbackOutcome::Confirmed(booking) => Self {
                success: true,
                booking_id: booking.id.to_string(),
                status: booking.status.to_string(),
                message: "Payment confirmed".to_string(),
            },
            CallbackOutcome::AlreadyConfirmed(booking) => Self {
                success: true,
                booking_id: booking.id.to_string(),
                status: booking.status.to_string(),
                message: "Payment already confirmed".to_string(),
            },
            CallbackOutcome::Declined {
                booking_id,
                response_code,
            } => Self {
                success: false,
                booking_id: booking_id.to_string(),
                status: "Failed".to_string(),
                message: format!("Payment declined with code {}", response_code),
            },
        }
    }
}

/// Browser redirect back from the gateway; fields arrive in the query string.
async fn payment_return(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<CallbackResponse>, AppError> {
    let outcome = state
        .payments
        .handle_callback(&params, CallbackFlow::Return)
        .await?;
    Ok(Json(outcome.into()))
}

/// Server-to-server notification; fields arrive form-encoded.
async fn payment_ipn(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> Result<Json<CallbackResponse>, AppError> {
    let outcome = state
        .payments
        .handle_callback(&params, CallbackFlow::Ipn)
        .await?;
    Ok(Json(outcome.into()))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Payment>, AppError> {
    let id = BookingId::parse(&id).map_err(|e| AppError::ValidationError(e.to_string()))?;
    Ok(Json(state.bookings.get_payment(&id).await?))
}

async fn get_payment_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Payment>, AppError> {
    let id = Uuid::parse_str(&id).map_err(|e| AppError::ValidationError(format!("Invalid payment id: {}", e)))?;
    match state.bookings.get_payment_by_id(id).await {
        Ok(payment) => Ok(Json(payment)),
        Err(BookingError::NotFound(_)) => Err(AppError::NotFoundError(format!("Payment not found: {}", id))),
        Err(e) => Err(e.into()),
    }
}
