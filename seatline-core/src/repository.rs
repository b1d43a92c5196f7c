use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seatline_shared::ReservationFact;
use uuid::Uuid;

use crate::booking::{Booking, BookingId, BookingStatus};
use crate::payment::{Payment, PaymentUpdate};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Duplicate booking id: {0}")]
    Duplicate(String),

    #[error("Stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// The trip and seats a booking held when it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatHolding<'a> {
    pub trip_id: &'a str,
    pub seats: &'a [String],
}

impl<'a> SeatHolding<'a> {
    pub fn of(booking: &'a Booking) -> Self {
        Self {
            trip_id: &booking.trip_id,
            seats: &booking.seat_numbers,
        }
    }

    pub fn matches(&self, booking: &Booking) -> bool {
        booking.trip_id == self.trip_id && booking.seat_numbers == self.seats
    }
}

/// A guarded status change. It only applies while the booking is in `from`
/// and, when `holding` is set, still holds exactly those seats. The payment
/// update and the fact are written in the same transaction.
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub holding: Option<SeatHolding<'a>>,
    pub payment: Option<PaymentUpdate>,
    pub fact: Option<&'a ReservationFact>,
}

/// Seat reassignment, guarded on the booking's status and on the seats it
/// held when read.
#[derive(Debug, Clone)]
pub struct SeatMove<'a> {
    pub expected: BookingStatus,
    pub from: SeatHolding<'a>,
    pub trip_id: &'a str,
    pub seats: &'a [String],
    pub facts: &'a [ReservationFact],
}

/// Booking and payment persistence. Every write that changes seat
/// occupancy records its reservation fact in the outbox atomically.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn insert(
        &self,
        booking: &Booking,
        payment: &Payment,
        fact: &ReservationFact,
    ) -> Result<(), RepositoryError>;

    async fn get(&self, id: &BookingId) -> Result<Option<Booking>, RepositoryError>;

    async fn find_by_trip(&self, trip_id: &str) -> Result<Vec<Booking>, RepositoryError>;

    async fn find_by_phone(&self, phone_number: &str) -> Result<Vec<Booking>, RepositoryError>;

    /// Pending bookings made before `cutoff`, oldest first.
    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Booking>, RepositoryError>;

    /// Returns `false` without writing anything when the guard fails.
    async fn transition(
        &self,
        id: &BookingId,
        transition: Transition<'_>,
    ) -> Result<bool, RepositoryError>;

    async fn move_seats(&self, id: &BookingId, change: SeatMove<'_>) -> Result<bool, RepositoryError>;

    async fn get_payment(&self, booking_id: &BookingId) -> Result<Option<Payment>, RepositoryError>;

    async fn get_payment_by_id(&self, payment_id: Uuid) -> Result<Option<Payment>, RepositoryError>;

    /// Marks an unsettled payment as failed. Returns `false` if it was
    /// already settled or does not exist.
    async fn fail_payment(&self, booking_id: &BookingId) -> Result<bool, RepositoryError>;
}
