use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use seatline_booking::{BookingReceipt, PaymentContext};
use seatline_core::{ActorKind, Booking, BookingId, CreateBookingRequest};
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/bookings", post(create_customer_booking))
        .route("/api/bookings/staff", post(create_staff_booking))
        .route("/api/bookings/phone", get(find_by_phone))
        .route("/api/bookings/confirmed", get(find_confirmed_by_phone))
        .route("/api/bookings/lookup-phone", get(lookup_by_phone))
        .route("/api/bookings/seat-trip", get(find_by_seat))
        .route("/api/bookings/lookup", get(lookup))
        .route("/api/bookings/change-seat", post(change_seat))
        .route("/api/bookings/{id}", get(get_booking))
        .route("/api/bookings/{id}/cancel", post(cancel_booking))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOptions {
    pub bank_code: Option<String>,
    pub locale: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneQuery {
    pub phone_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatTripQuery {
    pub trip_id: String,
    pub seat_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupQuery {
    pub phone_number: String,
    pub booking_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSeatRequest {
    pub booking_id: String,
    pub trip_id: String,
    pub seat_numbers: Vec<String>,
}

/// First hop of `X-Forwarded-For`, else loopback. The gateway only uses it
/// for fraud scoring.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("127.0.0.1")
        .to_string()
}

fn parse_id(raw: &str) -> Result<BookingId, AppError> {
    BookingId::parse(raw).map_err(|e| AppError::ValidationError(e.to_string()))
}

async fn create_customer_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(options): Query<PaymentOptions>,
    Json(req): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingReceipt>), AppError> {
    let context = PaymentContext {
        client_ip: client_ip(&headers),
        bank_code: options.bank_code.filter(|c| !c.trim().is_empty()),
        locale: options.locale.unwrap_or_else(|| "vn".to_string()),
    };
    let receipt = state
        .bookings
        .create_booking(req, ActorKind::Customer, &context)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn create_staff_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingReceipt>), AppError> {
    let context = PaymentContext {
        client_ip: client_ip(&headers),
        ..PaymentContext::default()
    };
    let receipt = state
        .bookings
        .create_booking(req, ActorKind::Staff, &context)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Booking>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(state.bookings.get_booking(&id).await?))
}

async fn find_by_phone(
    State(state): State<AppState>,
    Query(query): Query<PhoneQuery>,
) -> Result<Json<Vec<Booking>>, AppError> {
    Ok(Json(state.bookings.find_by_phone(&query.phone_number).await?))
}

async fn find_confirmed_by_phone(
    State(state): State<AppState>,
    Query(query): Query<PhoneQuery>,
) -> Result<Json<Vec<Booking>>, AppError> {
    Ok(Json(state.bookings.find_confirmed_by_phone(&query.phone_number).await?))
}

async fn lookup_by_phone(
    State(state): State<AppState>,
    Query(query): Query<PhoneQuery>,
) -> Result<Json<Vec<Booking>>, AppError> {
    Ok(Json(state.bookings.lookup_by_phone(&query.phone_number).await?))
}

async fn find_by_seat(
    State(state): State<AppState>,
    Query(query): Query<SeatTripQuery>,
) -> Result<Json<Booking>, AppError> {
    state
        .bookings
        .find_by_seat(&query.trip_id, &query.seat_number)
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::NotFoundError(format!(
                "No booking holds seat {} on trip {}",
                query.seat_number, query.trip_id
            ))
        })
}

async fn lookup(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<Booking>, AppError> {
    let id = parse_id(&query.booking_id)?;
    Ok(Json(state.bookings.lookup(&query.phone_number, &id).await?))
}

async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Booking>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(state.bookings.cancel_booking(&id).await?))
}

async fn change_seat(
    State(state): State<AppState>,
    Json(req): Json<ChangeSeatRequest>,
) -> Result<Json<Booking>, AppError> {
    let id = parse_id(&req.booking_id)?;
    Ok(Json(
        state
            .bookings
            .change_seat(&id, &req.trip_id, &req.seat_numbers)
            .await?,
    ))
}
