use chrono::{DateTime, Utc};
use seatline_core::booking::normalize_seats;
use seatline_core::{
    AcquireOutcome, ActorKind, Booking, BookingId, BookingRepository, BookingStatus, CoreError,
    CreateBookingRequest, LockError, Payment, PaymentMethod, PaymentUpdate, RepositoryError,
    SeatHolding, SeatLockStore, SeatMove, Transition, SEAT_HOLD_TTL,
};
use seatline_shared::ReservationFact;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::vnpay::{GatewayError, VnPayGateway};

const MAX_ID_ATTEMPTS: usize = 5;

/// Reloads allowed when a seat change lands between read and write.
const MAX_GUARD_ATTEMPTS: usize = 3;

const STALE_SWEEP_BATCH: usize = 100;

/// Request-scoped details needed to build the gateway redirect.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub client_ip: String,
    pub bank_code: Option<String>,
    pub locale: String,
}

impl Default for PaymentContext {
    fn default() -> Self {
        Self {
            client_ip: "127.0.0.1".to_string(),
            bank_code: None,
            locale: "vn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingReceipt {
    pub booking: Booking,
    pub amount: i64,
    pub payment_url: Option<String>,
}

/// Owns the booking state machine. Every status change goes through a
/// compare-and-set in the repository, so the request path, the gateway
/// callbacks and the expiry reaper can race safely.
pub struct BookingLifecycleManager {
    bookings: Arc<dyn BookingRepository>,
    locks: Arc<dyn SeatLockStore>,
    gateway: Arc<VnPayGateway>,
    hold_ttl: Duration,
    outbox_waker: Option<Arc<Notify>>,
}

impl BookingLifecycleManager {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        locks: Arc<dyn SeatLockStore>,
        gateway: Arc<VnPayGateway>,
    ) -> Self {
        Self {
            bookings,
            locks,
            gateway,
            hold_ttl: SEAT_HOLD_TTL,
            outbox_waker: None,
        }
    }

    pub fn with_hold_ttl(mut self, hold_ttl: Duration) -> Self {
        self.hold_ttl = hold_ttl;
        self
    }

    /// Wakes the outbox relay after each committed write.
    pub fn with_outbox_waker(mut self, waker: Arc<Notify>) -> Self {
        self.outbox_waker = Some(waker);
        self
    }

    pub fn gateway(&self) -> &VnPayGateway {
        &self.gateway
    }

    pub async fn create_booking(
        &self,
        request: CreateBookingRequest,
        actor: ActorKind,
        payment: &PaymentContext,
    ) -> Result<BookingReceipt, BookingError> {
        let seats = request.validate()?;
        let trip_id = request.trip_id.trim().to_string();

        for seat in &seats {
            if self.locks.exists(&trip_id, seat).await? {
                return Err(BookingError::SeatLocked(seat.clone()));
            }
        }
        self.ensure_not_persisted(&trip_id, &seats, None).await?;

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let booking = Booking::new(BookingId::generate(), &request, seats.clone(), actor);

            let payment_url = match booking.status {
                BookingStatus::Pending => Some(self.gateway.create_payment_url(
                    request.amount,
                    payment.bank_code.as_deref(),
                    &payment.client_ip,
                    &payment.locale,
                    booking.id.as_str(),
                )?),
                _ => None,
            };

            self.hold_seats(&booking).await?;

            let payment_record = Payment::for_booking(&booking, request.amount);
            let fact = ReservationFact::SeatsReserved {
                trip_id: booking.trip_id.clone(),
                seats: booking.seat_numbers.clone(),
            };

            match self.bookings.insert(&booking, &payment_record, &fact).await {
                Ok(()) => {
                    if booking.status != BookingStatus::Pending {
                        // Settled immediately; the database row is now authoritative.
                        self.release_hold(&booking).await;
                    }
                    self.wake_outbox();
                    info!(
                        booking_id = %booking.id,
                        trip_id = %booking.trip_id,
                        seats = ?booking.seat_numbers,
                        status = %booking.status,
                        phone = %booking.phone_number,
                        "Booking created"
                    );
                    return Ok(BookingReceipt {
                        booking,
                        amount: request.amount,
                        payment_url,
                    });
                }
                Err(RepositoryError::Duplicate(id)) => {
                    warn!(booking_id = %id, attempt, "Booking id collision, regenerating");
                    self.release_hold(&booking).await;
                }
                Err(e) => {
                    self.release_hold(&booking).await;
                    return Err(e.into());
                }
            }
        }

        Err(BookingError::Repository(RepositoryError::Backend(
            "could not allocate a unique booking id".to_string(),
        )))
    }

    /// Moves a still-pending booking to `Late` and frees its seats. Calling it
    /// again, or on a booking that already settled, returns the current status.
    ///
    /// The write is guarded on the seats that were read, so the released seats
    /// are always the ones the booking held when it expired.
    pub async fn expire_booking(&self, id: &BookingId) -> Result<BookingStatus, BookingError> {
        for attempt in 1..=MAX_GUARD_ATTEMPTS {
            let booking = self.load(id).await?;
            if booking.status != BookingStatus::Pending {
                debug!(booking_id = %id, status = %booking.status, "Expiry ignored, booking already settled");
                return Ok(booking.status);
            }

            let fact = ReservationFact::SeatsReleased {
                trip_id: booking.trip_id.clone(),
                seats: booking.seat_numbers.clone(),
            };
            let applied = self
                .bookings
                .transition(
                    id,
                    Transition {
                        from: BookingStatus::Pending,
                        to: BookingStatus::Late,
                        holding: Some(SeatHolding::of(&booking)),
                        payment: Some(PaymentUpdate::failed()),
                        fact: Some(&fact),
                    },
                )
                .await?;

            if applied {
                self.release_hold(&booking).await;
                self.wake_outbox();
                info!(booking_id = %id, trip_id = %booking.trip_id, seats = ?booking.seat_numbers, "Booking expired");
                return Ok(BookingStatus::Late);
            }
            debug!(booking_id = %id, attempt, "Booking changed while expiring, reloading");
        }

        Err(BookingError::ConcurrentUpdate(id.to_string()))
    }

    /// Expires Pending bookings whose hold has lapsed: older than the hold
    /// window, or with their expiry marker already gone. Covers expiry
    /// notifications lost while no reaper was subscribed. Returns how many
    /// bookings moved to `Late`.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize, BookingError> {
        let cutoff = now - chrono::Duration::seconds(self.hold_ttl.as_secs() as i64);
        let mut expired = 0;

        'sweep: loop {
            let pending = self.bookings.find_stale_pending(now, STALE_SWEEP_BATCH).await?;
            let mut progressed = false;
            for booking in &pending {
                // Oldest first: once one hold is still open, the rest are too.
                if !self.hold_lapsed(booking, cutoff).await {
                    break 'sweep;
                }
                match self.expire_booking(&booking.id).await {
                    Ok(status) => {
                        progressed = true;
                        if status == BookingStatus::Late {
                            expired += 1;
                        }
                    }
                    Err(e) => warn!(booking_id = %booking.id, error = %e, "Failed to expire stale booking"),
                }
            }
            if pending.len() < STALE_SWEEP_BATCH || !progressed {
                break;
            }
        }

        if expired > 0 {
            info!(expired, %cutoff, "Expired stale pending bookings");
        }
        Ok(expired)
    }

    async fn hold_lapsed(&self, booking: &Booking, cutoff: DateTime<Utc>) -> bool {
        if booking.booking_time < cutoff {
            return true;
        }
        match self.locks.expiry_marker_exists(&booking.id).await {
            Ok(live) => !live,
            Err(e) => {
                warn!(booking_id = %booking.id, error = %e, "Could not check expiry marker");
                false
            }
        }
    }

    /// Pending → Booked after a verified gateway success.
    pub async fn confirm_payment(&self, id: &BookingId) -> Result<Booking, BookingError> {
        let mut booking = self.load(id).await?;
        if booking.status != BookingStatus::Pending {
            return Err(BookingError::InvalidStatus {
                booking_id: id.to_string(),
                from: booking.status,
            });
        }

        let applied = self
            .bookings
            .transition(
                id,
                Transition {
                    from: BookingStatus::Pending,
                    to: BookingStatus::Booked,
                    holding: None,
                    payment: Some(PaymentUpdate::succeeded(PaymentMethod::Vnpay)),
                    fact: None,
                },
            )
            .await?;

        if !applied {
            let current = self.load(id).await?;
            return Err(BookingError::InvalidStatus {
                booking_id: id.to_string(),
                from: current.status,
            });
        }

        if let Err(e) = self.locks.release_booking_marker(id).await {
            warn!(booking_id = %id, error = %e, "Failed to clear expiry marker after payment");
        }
        booking.status = BookingStatus::Booked;
        info!(booking_id = %id, "Payment confirmed, booking is Booked");
        Ok(booking)
    }

    /// Records a declined gateway payment. The booking stays Pending until it
    /// is paid or reaped.
    pub async fn record_payment_failure(&self, id: &BookingId) -> Result<bool, BookingError> {
        self.load(id).await?;
        let changed = self.bookings.fail_payment(id).await?;
        if changed {
            info!(booking_id = %id, "Payment marked as failed");
        }
        Ok(changed)
    }

    pub async fn cancel_booking(&self, id: &BookingId) -> Result<Booking, BookingError> {
        for attempt in 1..=MAX_GUARD_ATTEMPTS {
            let mut booking = self.load(id).await?;
            if !booking.status.can_transition_to(BookingStatus::Cancelled) {
                return Err(BookingError::InvalidStatus {
                    booking_id: id.to_string(),
                    from: booking.status,
                });
            }

            let fact = ReservationFact::SeatsReleased {
                trip_id: booking.trip_id.clone(),
                seats: booking.seat_numbers.clone(),
            };
            let payment = match booking.status {
                BookingStatus::Pending => Some(PaymentUpdate::failed()),
                _ => None,
            };
            let applied = self
                .bookings
                .transition(
                    id,
                    Transition {
                        from: booking.status,
                        to: BookingStatus::Cancelled,
                        holding: Some(SeatHolding::of(&booking)),
                        payment,
                        fact: Some(&fact),
                    },
                )
                .await?;

            if applied {
                self.release_hold(&booking).await;
                self.wake_outbox();
                booking.status = BookingStatus::Cancelled;
                info!(booking_id = %id, trip_id = %booking.trip_id, "Booking cancelled");
                return Ok(booking);
            }
            debug!(booking_id = %id, attempt, "Booking changed while cancelling, reloading");
        }

        Err(BookingError::ConcurrentUpdate(id.to_string()))
    }

    /// Reassigns a live booking to other seats, possibly on another trip.
    pub async fn change_seat(
        &self,
        id: &BookingId,
        new_trip_id: &str,
        new_seats: &[String],
    ) -> Result<Booking, BookingError> {
        let mut booking = self.load(id).await?;
        if !booking.status.holds_seats() {
            return Err(BookingError::InvalidStatus {
                booking_id: id.to_string(),
                from: booking.status,
            });
        }
        let new_trip_id = new_trip_id.trim();
        if new_trip_id.is_empty() {
            return Err(BookingError::Validation("Trip id is required".to_string()));
        }
        let seats = normalize_seats(new_seats)?;

        let same_trip = new_trip_id == booking.trip_id;
        let added: Vec<String> = seats
            .iter()
            .filter(|seat| !(same_trip && booking.seat_numbers.contains(seat)))
            .cloned()
            .collect();
        let dropped: Vec<String> = booking
            .seat_numbers
            .iter()
            .filter(|seat| !(same_trip && seats.contains(seat)))
            .cloned()
            .collect();
        if added.is_empty() && dropped.is_empty() {
            return Ok(booking);
        }

        if !added.is_empty() {
            self.ensure_not_persisted(new_trip_id, &added, Some(id)).await?;
            if let AcquireOutcome::Conflict(seat) = self
                .locks
                .try_acquire(new_trip_id, &added, id, self.hold_ttl)
                .await?
            {
                return Err(BookingError::SeatLocked(seat));
            }
            if let Err(e) = self.ensure_not_persisted(new_trip_id, &added, Some(id)).await {
                self.release_seats(new_trip_id, &added, id).await;
                return Err(e);
            }
        }

        let facts =
            ReservationFact::for_seat_change(&booking.trip_id, &booking.seat_numbers, new_trip_id, &seats);
        let applied = match self
            .bookings
            .move_seats(
                id,
                SeatMove {
                    expected: booking.status,
                    from: SeatHolding::of(&booking),
                    trip_id: new_trip_id,
                    seats: &seats,
                    facts: &facts,
                },
            )
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                self.release_seats(new_trip_id, &added, id).await;
                return Err(e.into());
            }
        };

        if !applied {
            self.release_seats(new_trip_id, &added, id).await;
            let current = self.load(id).await?;
            if current.status == booking.status {
                return Err(BookingError::ConcurrentUpdate(id.to_string()));
            }
            return Err(BookingError::InvalidStatus {
                booking_id: id.to_string(),
                from: current.status,
            });
        }

        self.release_seats(&booking.trip_id, &dropped, id).await;
        if booking.status != BookingStatus::Pending {
            self.release_seats(new_trip_id, &added, id).await;
        }
        self.wake_outbox();

        info!(
            booking_id = %id,
            from_trip = %booking.trip_id,
            to_trip = %new_trip_id,
            seats = ?seats,
            "Booking seats changed"
        );
        booking.trip_id = new_trip_id.to_string();
        booking.seat_numbers = seats;
        Ok(booking)
    }

    pub async fn get_booking(&self, id: &BookingId) -> Result<Booking, BookingError> {
        self.load(id).await
    }

    pub async fn get_payment(&self, id: &BookingId) -> Result<Payment, BookingError> {
        self.bookings
            .get_payment(id)
            .await?
            .ok_or_else(|| BookingError::NotFound(id.to_string()))
    }

    pub async fn get_payment_by_id(&self, payment_id: Uuid) -> Result<Payment, BookingError> {
        self.bookings
            .get_payment_by_id(payment_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(payment_id.to_string()))
    }

    pub async fn find_by_phone(&self, phone_number: &str) -> Result<Vec<Booking>, BookingError> {
        Ok(self.bookings.find_by_phone(phone_number.trim()).await?)
    }

    /// Counter bookings issued to this phone.
    pub async fn find_confirmed_by_phone(&self, phone_number: &str) -> Result<Vec<Booking>, BookingError> {
        let bookings = self.find_by_phone(phone_number).await?;
        Ok(bookings
            .into_iter()
            .filter(|b| b.status == BookingStatus::Confirmed)
            .collect())
    }

    /// Bookings on this phone that still hold their seats.
    pub async fn lookup_by_phone(&self, phone_number: &str) -> Result<Vec<Booking>, BookingError> {
        let bookings = self.find_by_phone(phone_number).await?;
        Ok(bookings.into_iter().filter(|b| b.status.holds_seats()).collect())
    }

    /// The live booking currently holding `seat` on `trip_id`, if any.
    pub async fn find_by_seat(&self, trip_id: &str, seat: &str) -> Result<Option<Booking>, BookingError> {
        let bookings = self.bookings.find_by_trip(trip_id).await?;
        Ok(bookings.into_iter().find(|b| b.holds_seat(trip_id, seat)))
    }

    /// Ticket lookup: the booking is only revealed to the matching phone.
    pub async fn lookup(&self, phone_number: &str, id: &BookingId) -> Result<Booking, BookingError> {
        let booking = self.load(id).await?;
        if booking.phone_number.expose() != phone_number.trim() {
            return Err(BookingError::NotFound(id.to_string()));
        }
        Ok(booking)
    }

    async fn load(&self, id: &BookingId) -> Result<Booking, BookingError> {
        self.bookings
            .get(id)
            .await?
            .ok_or_else(|| BookingError::NotFound(id.to_string()))
    }

    async fn ensure_not_persisted(
        &self,
        trip_id: &str,
        seats: &[String],
        exclude: Option<&BookingId>,
    ) -> Result<(), BookingError> {
        let existing = self.bookings.find_by_trip(trip_id).await?;
        let conflicts: Vec<String> = seats
            .iter()
            .filter(|seat| {
                existing
                    .iter()
                    .any(|b| Some(&b.id) != exclude && b.holds_seat(trip_id, seat))
            })
            .cloned()
            .collect();

        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(BookingError::SeatConflict(conflicts))
        }
    }

    /// Locks every seat of the booking, re-checks persisted bookings under the
    /// lock, and sets the expiry marker for bookings awaiting payment.
    async fn hold_seats(&self, booking: &Booking) -> Result<(), BookingError> {
        let outcome = self
            .locks
            .try_acquire(&booking.trip_id, &booking.seat_numbers, &booking.id, self.hold_ttl)
            .await?;
        if let AcquireOutcome::Conflict(seat) = outcome {
            return Err(BookingError::SeatLocked(seat));
        }

        if let Err(e) = self
            .ensure_not_persisted(&booking.trip_id, &booking.seat_numbers, Some(&booking.id))
            .await
        {
            self.release_seats(&booking.trip_id, &booking.seat_numbers, &booking.id).await;
            return Err(e);
        }

        if booking.status == BookingStatus::Pending {
            if let Err(e) = self.locks.set_expiry_marker(&booking.id, self.hold_ttl).await {
                self.release_seats(&booking.trip_id, &booking.seat_numbers, &booking.id).await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn release_hold(&self, booking: &Booking) {
        self.release_seats(&booking.trip_id, &booking.seat_numbers, &booking.id).await;
        if let Err(e) = self.locks.release_booking_marker(&booking.id).await {
            warn!(booking_id = %booking.id, error = %e, "Failed to release expiry marker");
        }
    }

    /// Lock cleanup is best effort: a missed release still expires with its TTL.
    async fn release_seats(&self, trip_id: &str, seats: &[String], owner: &BookingId) {
        if seats.is_empty() {
            return;
        }
        if let Err(e) = self.locks.release(trip_id, seats, Some(owner)).await {
            warn!(booking_id = %owner, trip_id, error = %e, "Failed to release seat locks");
        }
    }

    fn wake_outbox(&self) {
        if let Some(waker) = &self.outbox_waker {
            waker.notify_one();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Seat {0} is temporarily locked by another booking")]
    SeatLocked(String),

    #[error("Seats already booked: {}", .0.join(", "))]
    SeatConflict(Vec<String>),

    #[error("Booking not found: {0}")]
    NotFound(String),

    #[error("Booking {booking_id} cannot change state from {from}")]
    InvalidStatus { booking_id: String, from: BookingStatus },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Booking {0} was changed concurrently, retry the request")]
    ConcurrentUpdate(String),

    #[error("Seat lock store unavailable: {0}")]
    StoreUnavailable(#[from] LockError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<CoreError> for BookingError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ValidationError(msg) => BookingError::Validation(msg),
            other => BookingError::Validation(other.to_string()),
        }
    }
}
