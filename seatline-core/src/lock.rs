use async_trait::async_trait;
use std::time::Duration;

use crate::booking::BookingId;

/// Seat locks and expiry markers live for fifteen minutes.
pub const SEAT_HOLD_TTL: Duration = Duration::from_secs(15 * 60);

pub const SEAT_LOCK_PREFIX: &str = "booking:";
pub const EXPIRY_MARKER_PREFIX: &str = "booking_expire:";

pub fn seat_lock_key(trip_id: &str, seat: &str) -> String {
    format!("{}{}:{}", SEAT_LOCK_PREFIX, trip_id, seat)
}

pub fn expiry_marker_key(booking_id: &BookingId) -> String {
    format!("{}{}", EXPIRY_MARKER_PREFIX, booking_id)
}

/// Extracts the booking id from an expired `booking_expire:{id}` key.
pub fn parse_expiry_marker(key: &str) -> Option<BookingId> {
    key.strip_prefix(EXPIRY_MARKER_PREFIX)
        .and_then(|id| BookingId::parse(id).ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// Nothing was locked; the named seat is held by someone else.
    Conflict(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),

    #[error("Lock store timed out after {0:?}")]
    Timeout(Duration),
}

/// TTL-backed reservation locks, one key per (trip, seat) plus one expiry
/// marker per booking.
#[async_trait]
pub trait SeatLockStore: Send + Sync {
    /// All-or-nothing: either every seat is locked for `booking_id` or none is.
    async fn try_acquire(
        &self,
        trip_id: &str,
        seats: &[String],
        booking_id: &BookingId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, LockError>;

    async fn lock_owner(&self, trip_id: &str, seat: &str) -> Result<Option<BookingId>, LockError>;

    async fn exists(&self, trip_id: &str, seat: &str) -> Result<bool, LockError> {
        Ok(self.lock_owner(trip_id, seat).await?.is_some())
    }

    /// With an `owner`, only locks still held by that booking are removed.
    async fn release(
        &self,
        trip_id: &str,
        seats: &[String],
        owner: Option<&BookingId>,
    ) -> Result<(), LockError>;

    async fn set_expiry_marker(&self, booking_id: &BookingId, ttl: Duration) -> Result<(), LockError>;

    /// Whether the booking's hold window is still open.
    async fn expiry_marker_exists(&self, booking_id: &BookingId) -> Result<bool, LockError>;

    async fn release_booking_marker(&self, booking_id: &BookingId) -> Result<(), LockError>;
}

/// A live subscription to key-expiry notifications.
#[async_trait]
pub trait ExpirySubscription: Send {
    /// Next expired key. `None` means the subscription was lost.
    async fn next_expired(&mut self) -> Option<String>;
}

#[async_trait]
pub trait ExpirySource: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn ExpirySubscription>, LockError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let id = BookingId::parse("Ab12Cd").unwrap();
        assert_eq!(seat_lock_key("T1", "A1"), "booking:T1:A1");
        assert_eq!(expiry_marker_key(&id), "booking_expire:Ab12Cd");
        assert_eq!(parse_expiry_marker("booking_expire:Ab12Cd"), Some(id));
        assert_eq!(parse_expiry_marker("booking:T1:A1"), None);
        assert_eq!(parse_expiry_marker("booking_expire:bad"), None);
    }
}
