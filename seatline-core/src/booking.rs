use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use seatline_shared::Masked;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

pub const BOOKING_ID_LEN: usize = 6;

/// Six-character alphanumeric booking reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BookingId(String);

impl BookingId {
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(BOOKING_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        if raw.len() == BOOKING_ID_LEN && raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(Self(raw.to_string()))
        } else {
            Err(CoreError::ValidationError(format!("Invalid booking id: {}", raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BookingId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BookingId> for String {
    fn from(id: BookingId) -> Self {
        id.0
    }
}

/// Booking lifecycle.
///
/// ```text
/// Pending ──► Booked ──► Cancelled
///    │ ├────► Confirmed ─► Cancelled
///    │ ├────► Late
///    └──────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Booked,
    Confirmed,
    Cancelled,
    Late,
}

impl BookingStatus {
    pub fn allowed_transitions(self) -> &'static [BookingStatus] {
        use BookingStatus::*;
        match self {
            Pending => &[Booked, Confirmed, Late, Cancelled],
            Booked => &[Cancelled],
            Confirmed => &[Cancelled],
            Cancelled | Late => &[],
        }
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Whether a booking in this state still occupies its seats.
    pub fn holds_seats(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "Pending",
            BookingStatus::Booked => "Booked",
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::Cancelled => "Cancelled",
            BookingStatus::Late => "Late",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(BookingStatus::Pending),
            "Booked" => Ok(BookingStatus::Booked),
            "Confirmed" => Ok(BookingStatus::Confirmed),
            "Cancelled" => Ok(BookingStatus::Cancelled),
            "Late" => Ok(BookingStatus::Late),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Who is creating the booking. Counter staff skip the payment step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Customer,
    Staff,
}

impl ActorKind {
    pub fn initial_status(self) -> BookingStatus {
        match self {
            ActorKind::Customer => BookingStatus::Pending,
            ActorKind::Staff => BookingStatus::Confirmed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: BookingId,
    pub phone_number: Masked<String>,
    pub email: Option<String>,
    pub customer_name: String,
    pub trip_id: String,
    pub seat_numbers: Vec<String>,
    pub booking_time: DateTime<Utc>,
    pub status: BookingStatus,
    pub pick_up_point: Option<String>,
    pub drop_off_point: Option<String>,
}

impl Booking {
    pub fn new(id: BookingId, request: &CreateBookingRequest, seats: Vec<String>, actor: ActorKind) -> Self {
        Self {
            id,
            phone_number: request.phone_number.clone(),
            email: request.email.clone().filter(|e| !e.trim().is_empty()),
            customer_name: request.customer_name.trim().to_string(),
            trip_id: request.trip_id.trim().to_string(),
            seat_numbers: seats,
            booking_time: Utc::now(),
            status: actor.initial_status(),
            pick_up_point: request.pick_up_point.clone(),
            drop_off_point: request.drop_off_point.clone(),
        }
    }

    pub fn holds_seat(&self, trip_id: &str, seat: &str) -> bool {
        self.status.holds_seats() && self.trip_id == trip_id && self.seat_numbers.iter().any(|s| s == seat)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingRequest {
    pub phone_number: Masked<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub customer_name: String,
    pub trip_id: String,
    pub seat_numbers: Vec<String>,
    pub amount: i64,
    #[serde(default)]
    pub pick_up_point: Option<String>,
    #[serde(default)]
    pub drop_off_point: Option<String>,
}

impl CreateBookingRequest {
    /// Checks required fields and returns the requested seats as an ordered,
    /// duplicate-free list.
    pub fn validate(&self) -> Result<Vec<String>, CoreError> {
        if self.phone_number.expose().trim().is_empty() {
            return Err(CoreError::ValidationError("Phone number is required".to_string()));
        }
        if self.customer_name.trim().is_empty() {
            return Err(CoreError::ValidationError("Customer name is required".to_string()));
        }
        if self.trip_id.trim().is_empty() {
            return Err(CoreError::ValidationError("Trip id is required".to_string()));
        }
        if self.amount <= 0 {
            return Err(CoreError::ValidationError("Amount must be greater than 0".to_string()));
        }
        normalize_seats(&self.seat_numbers)
    }
}

pub fn normalize_seats(seats: &[String]) -> Result<Vec<String>, CoreError> {
    let mut normalized: Vec<String> = Vec::with_capacity(seats.len());
    for seat in seats {
        let label = seat.trim();
        if label.is_empty() {
            return Err(CoreError::ValidationError("Seat labels must not be empty".to_string()));
        }
        if !normalized.iter().any(|s| s == label) {
            normalized.push(label.to_string());
        }
    }
    if normalized.is_empty() {
        return Err(CoreError::ValidationError("At least one seat must be selected".to_string()));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_six_alphanumerics() {
        for _ in 0..100 {
            let id = BookingId::generate();
            assert!(BookingId::parse(id.as_str()).is_ok());
        }
        assert!(BookingId::parse("abc12").is_err());
        assert!(BookingId::parse("abc-12").is_err());
    }

    #[test]
    fn test_transition_table() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Booked));
        assert!(Pending.can_transition_to(Late));
        assert!(Booked.can_transition_to(Cancelled));
        assert!(!Booked.can_transition_to(Late));
        assert!(!Late.can_transition_to(Booked));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(Late.is_terminal() && Cancelled.is_terminal());
        assert!(Confirmed.holds_seats());
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [BookingStatus::Pending, BookingStatus::Booked, BookingStatus::Late] {
            assert_eq!(status.as_str().parse::<BookingStatus>().unwrap(), status);
        }
        assert!("Expired".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn test_normalize_seats_dedupes_in_order() {
        let seats = vec!["A2".to_string(), " A1 ".to_string(), "A2".to_string()];
        assert_eq!(normalize_seats(&seats).unwrap(), vec!["A2", "A1"]);
        assert!(normalize_seats(&[]).is_err());
        assert!(normalize_seats(&["  ".to_string()]).is_err());
    }
}
