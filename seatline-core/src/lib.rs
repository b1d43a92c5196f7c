pub mod booking;
pub mod inventory;
pub mod lock;
pub mod memory;
pub mod outbox;
pub mod payment;
pub mod repository;

pub use booking::{ActorKind, Booking, BookingId, BookingStatus, CreateBookingRequest};
pub use inventory::{SaveOutcome, TripInventoryRepository, TripSeatInventory};
pub use lock::{AcquireOutcome, ExpirySource, ExpirySubscription, LockError, SeatLockStore, SEAT_HOLD_TTL};
pub use outbox::{EventPublisher, OutboxEntry, OutboxStore, PublishError};
pub use payment::{Payment, PaymentMethod, PaymentStatus, PaymentUpdate};
pub use repository::{BookingRepository, RepositoryError, SeatHolding, SeatMove, Transition};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Unknown status value: {0}")]
    UnknownStatus(String),
}
