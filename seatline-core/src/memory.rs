//! In-process implementations of the store traits.
//!
//! Used by tests and local runs; they honour the same guards and atomicity
//! as the Redis, Postgres and Kafka backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::booking::{Booking, BookingId, BookingStatus};
use crate::inventory::{SaveOutcome, TripInventoryRepository, TripSeatInventory};
use crate::lock::{
    expiry_marker_key, seat_lock_key, AcquireOutcome, ExpirySource, ExpirySubscription, LockError,
    SeatLockStore,
};
use crate::outbox::{EventPublisher, OutboxEntry, OutboxStore, PublishError};
use crate::payment::{Payment, PaymentStatus};
use crate::repository::{BookingRepository, RepositoryError, SeatMove, Transition};
use seatline_shared::ReservationFact;

// ---------------------------------------------------------------------------
// Seat locks
// ---------------------------------------------------------------------------

pub struct InMemorySeatLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    expired_tx: std::sync::Mutex<broadcast::Sender<String>>,
    unavailable: AtomicBool,
    released: AtomicUsize,
}

impl InMemorySeatLockStore {
    pub fn new() -> Self {
        let (expired_tx, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            expired_tx: std::sync::Mutex::new(expired_tx),
            unavailable: AtomicBool::new(false),
            released: AtomicUsize::new(0),
        }
    }

    /// Simulates the backing store going down (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of seat-lock keys removed through `release`.
    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Drops every entry past its deadline and emits an expiry notification
    /// for each, the way Redis does for `__keyevent@0__:expired`.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let tx = self.sender();
        for key in &expired {
            entries.remove(key);
            let _ = tx.send(key.clone());
        }
        expired.len()
    }

    /// Closes every open expiry subscription, as a dropped pub/sub
    /// connection would. Later subscribers get a fresh channel.
    pub fn disconnect_subscribers(&self) {
        let (fresh, _) = broadcast::channel(256);
        let mut tx = self.expired_tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *tx = fresh;
    }

    fn sender(&self) -> broadcast::Sender<String> {
        self.expired_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn locked_seats(&self, trip_id: &str) -> Vec<String> {
        let prefix = seat_lock_key(trip_id, "");
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut seats: Vec<String> = entries
            .iter()
            .filter(|(key, (_, deadline))| key.starts_with(&prefix) && *deadline > now)
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect();
        seats.sort();
        seats
    }

    pub async fn has_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .get(key)
            .map(|(_, deadline)| *deadline > now)
            .unwrap_or(false)
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LockError::Unavailable("in-memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemorySeatLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SeatLockStore for InMemorySeatLockStore {
    async fn try_acquire(
        &self,
        trip_id: &str,
        seats: &[String],
        booking_id: &BookingId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, LockError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        for seat in seats {
            let key = seat_lock_key(trip_id, seat);
            if matches!(entries.get(&key), Some((_, deadline)) if *deadline > now) {
                return Ok(AcquireOutcome::Conflict(seat.clone()));
            }
        }
        for seat in seats {
            entries.insert(seat_lock_key(trip_id, seat), (booking_id.to_string(), now + ttl));
        }
        Ok(AcquireOutcome::Acquired)
    }

    async fn lock_owner(&self, trip_id: &str, seat: &str) -> Result<Option<BookingId>, LockError> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&seat_lock_key(trip_id, seat))
            .filter(|(_, deadline)| *deadline > now)
            .and_then(|(owner, _)| BookingId::parse(owner).ok()))
    }

    async fn release(
        &self,
        trip_id: &str,
        seats: &[String],
        owner: Option<&BookingId>,
    ) -> Result<(), LockError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        for seat in seats {
            let key = seat_lock_key(trip_id, seat);
            let owned = match (entries.get(&key), owner) {
                (Some(_), None) => true,
                (Some((holder, _)), Some(owner)) => holder == owner.as_str(),
                (None, _) => false,
            };
            if owned {
                entries.remove(&key);
                self.released.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn set_expiry_marker(&self, booking_id: &BookingId, ttl: Duration) -> Result<(), LockError> {
        self.check_available()?;
        let deadline = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(expiry_marker_key(booking_id), ("1".to_string(), deadline));
        Ok(())
    }

    async fn expiry_marker_exists(&self, booking_id: &BookingId) -> Result<bool, LockError> {
        self.check_available()?;
        Ok(self.has_key(&expiry_marker_key(booking_id)).await)
    }

    async fn release_booking_marker(&self, booking_id: &BookingId) -> Result<(), LockError> {
        self.check_available()?;
        self.entries.lock().await.remove(&expiry_marker_key(booking_id));
        Ok(())
    }
}

pub struct InMemoryExpirySubscription {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl ExpirySubscription for InMemoryExpirySubscription {
    async fn next_expired(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(key) => return Some(key),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Expiry subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl ExpirySource for InMemorySeatLockStore {
    async fn subscribe(&self) -> Result<Box<dyn ExpirySubscription>, LockError> {
        self.check_available()?;
        Ok(Box::new(InMemoryExpirySubscription {
            rx: self.sender().subscribe(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Bookings, payments and the outbox
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BookingState {
    bookings: HashMap<BookingId, Booking>,
    payments: HashMap<BookingId, Payment>,
    outbox: Vec<(OutboxEntry, bool)>,
}

#[derive(Default)]
pub struct InMemoryBookingRepository {
    state: Mutex<BookingState>,
}

impl InMemoryBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fact ever recorded, published or not.
    pub async fn recorded_facts(&self) -> Vec<ReservationFact> {
        self.state
            .lock()
            .await
            .outbox
            .iter()
            .map(|(entry, _)| entry.fact.clone())
            .collect()
    }
}

#[async_trait]
impl BookingRepository for InMemoryBookingRepository {
    async fn insert(
        &self,
        booking: &Booking,
        payment: &Payment,
        fact: &ReservationFact,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        if state.bookings.contains_key(&booking.id) {
            return Err(RepositoryError::Duplicate(booking.id.to_string()));
        }
        state.bookings.insert(booking.id.clone(), booking.clone());
        state.payments.insert(booking.id.clone(), payment.clone());
        state.outbox.push((OutboxEntry::new(fact.clone()), false));
        Ok(())
    }

    async fn get(&self, id: &BookingId) -> Result<Option<Booking>, RepositoryError> {
        Ok(self.state.lock().await.bookings.get(id).cloned())
    }

    async fn find_by_trip(&self, trip_id: &str) -> Result<Vec<Booking>, RepositoryError> {
        let state = self.state.lock().await;
        let mut bookings: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.trip_id == trip_id)
            .cloned()
            .collect();
        bookings.sort_by_key(|b| b.booking_time);
        Ok(bookings)
    }

    async fn find_by_phone(&self, phone_number: &str) -> Result<Vec<Booking>, RepositoryError> {
        let state = self.state.lock().await;
        let mut bookings: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.phone_number.expose() == phone_number)
            .cloned()
            .collect();
        bookings.sort_by_key(|b| b.booking_time);
        Ok(bookings)
    }

    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Booking>, RepositoryError> {
        let state = self.state.lock().await;
        let mut stale: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.booking_time < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|b| b.booking_time);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn transition(
        &self,
        id: &BookingId,
        transition: Transition<'_>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(booking) = state.bookings.get_mut(id) else {
            return Ok(false);
        };
        if booking.status != transition.from
            || transition.holding.is_some_and(|held| !held.matches(booking))
        {
            return Ok(false);
        }
        booking.status = transition.to;
        if let (Some(update), Some(payment)) = (transition.payment, state.payments.get_mut(id)) {
            payment.status = update.status;
            if let Some(method) = update.method {
                payment.method = method;
            }
            payment.payment_time = chrono::Utc::now();
        }
        if let Some(fact) = transition.fact {
            state.outbox.push((OutboxEntry::new(fact.clone()), false));
        }
        Ok(true)
    }

    async fn move_seats(&self, id: &BookingId, change: SeatMove<'_>) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(booking) = state.bookings.get_mut(id) else {
            return Ok(false);
        };
        if booking.status != change.expected || !change.from.matches(booking) {
            return Ok(false);
        }
        booking.trip_id = change.trip_id.to_string();
        booking.seat_numbers = change.seats.to_vec();
        for fact in change.facts {
            state.outbox.push((OutboxEntry::new(fact.clone()), false));
        }
        Ok(true)
    }

    async fn get_payment(&self, booking_id: &BookingId) -> Result<Option<Payment>, RepositoryError> {
        Ok(self.state.lock().await.payments.get(booking_id).cloned())
    }

    async fn get_payment_by_id(&self, payment_id: Uuid) -> Result<Option<Payment>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.payments.values().find(|p| p.id == payment_id).cloned())
    }

    async fn fail_payment(&self, booking_id: &BookingId) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        match state.payments.get_mut(booking_id) {
            Some(payment) if !payment.status.is_settled() => {
                payment.status = PaymentStatus::Failed;
                payment.payment_time = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryBookingRepository {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|(_, published)| !published)
            .take(limit)
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        if let Some((_, published)) = state.outbox.iter_mut().find(|(entry, _)| entry.id == id) {
            *published = true;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub kind: String,
    pub key: String,
    pub payload: String,
}

/// Records published messages in order; can be told to reject publishes.
#[derive(Default)]
pub struct InMemoryEventBus {
    messages: Mutex<Vec<PublishedMessage>>,
    failing: AtomicBool,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.messages.lock().await.clone()
    }

    /// Removes and returns everything published so far.
    pub async fn drain(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.messages.lock().await)
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError> {
        let topic = entry.fact.topic();
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Broker {
                topic: topic.to_string(),
                reason: "in-memory bus marked failing".to_string(),
            });
        }
        let payload = entry.fact.encode(Some(entry.id))?;
        self.messages.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            kind: entry.fact.kind().to_string(),
            key: entry.fact.partition_key().to_string(),
            payload,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trip inventory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryTripInventoryRepository {
    trips: Mutex<HashMap<String, TripSeatInventory>>,
    processed: Mutex<HashSet<Uuid>>,
}

impl InMemoryTripInventoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_trip(&self, trip_id: &str, capacity: u32) {
        self.trips
            .lock()
            .await
            .insert(trip_id.to_string(), TripSeatInventory::new(trip_id, capacity));
    }
}

#[async_trait]
impl TripInventoryRepository for InMemoryTripInventoryRepository {
    async fn load(&self, trip_id: &str) -> Result<Option<TripSeatInventory>, RepositoryError> {
        Ok(self.trips.lock().await.get(trip_id).cloned())
    }

    async fn save(&self, inventory: &TripSeatInventory) -> Result<SaveOutcome, RepositoryError> {
        let mut trips = self.trips.lock().await;
        match trips.get_mut(&inventory.trip_id) {
            Some(current) if current.version == inventory.version => {
                *current = inventory.clone();
                current.version += 1;
                Ok(SaveOutcome::Saved)
            }
            Some(_) => Ok(SaveOutcome::VersionConflict),
            None => Err(RepositoryError::Backend(format!(
                "trip {} has no inventory row",
                inventory.trip_id
            ))),
        }
    }

    async fn is_processed(&self, fact_id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.processed.lock().await.contains(&fact_id))
    }

    async fn mark_processed(&self, fact_id: Uuid) -> Result<(), RepositoryError> {
        self.processed.lock().await.insert(fact_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> BookingId {
        BookingId::parse(raw).unwrap()
    }

    fn seats(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_batch_acquire_is_all_or_nothing() {
        let store = InMemorySeatLockStore::new();
        let ttl = Duration::from_secs(60);

        let first = store.try_acquire("T1", &seats(&["A2"]), &id("aaaaaa"), ttl).await.unwrap();
        assert_eq!(first, AcquireOutcome::Acquired);

        let second = store
            .try_acquire("T1", &seats(&["A1", "A2", "A3"]), &id("bbbbbb"), ttl)
            .await
            .unwrap();
        assert_eq!(second, AcquireOutcome::Conflict("A2".to_string()));
        assert_eq!(store.locked_seats("T1").await, vec!["A2".to_string()]);
    }

    #[tokio::test]
    async fn test_owner_scoped_release_keeps_foreign_locks() {
        let store = InMemorySeatLockStore::new();
        let ttl = Duration::from_secs(60);
        store.try_acquire("T1", &seats(&["A1"]), &id("aaaaaa"), ttl).await.unwrap();

        store.release("T1", &seats(&["A1"]), Some(&id("bbbbbb"))).await.unwrap();
        assert!(store.exists("T1", "A1").await.unwrap());

        store.release("T1", &seats(&["A1"]), Some(&id("aaaaaa"))).await.unwrap();
        assert!(!store.exists("T1", "A1").await.unwrap());
        assert_eq!(store.released_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_closed() {
        let store = InMemorySeatLockStore::new();
        store.set_unavailable(true);
        let result = store
            .try_acquire("T1", &seats(&["A1"]), &id("aaaaaa"), Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(LockError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_notifies_expired_markers() {
        let store = InMemorySeatLockStore::new();
        let mut sub = store.subscribe().await.unwrap();
        store.set_expiry_marker(&id("aaaaaa"), Duration::from_secs(5)).await.unwrap();

        assert_eq!(store.sweep().await, 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.sweep().await, 1);
        assert_eq!(sub.next_expired().await.as_deref(), Some("booking_expire:aaaaaa"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_old_subscriptions_only() {
        let store = InMemorySeatLockStore::new();
        let mut old = store.subscribe().await.unwrap();
        store.disconnect_subscribers();
        assert_eq!(old.next_expired().await, None);

        let mut fresh = store.subscribe().await.unwrap();
        store.set_expiry_marker(&id("aaaaaa"), Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        store.sweep().await;
        assert_eq!(fresh.next_expired().await.as_deref(), Some("booking_expire:aaaaaa"));
    }

    #[tokio::test]
    async fn test_trip_save_rejects_stale_version() {
        let repo = InMemoryTripInventoryRepository::new();
        repo.insert_trip("T1", 40).await;

        let stale = repo.load("T1").await.unwrap().unwrap();
        let mut fresh = stale.clone();
        fresh.booked_seats.insert("A1".to_string());
        assert_eq!(repo.save(&fresh).await.unwrap(), SaveOutcome::Saved);
        assert_eq!(repo.save(&stale).await.unwrap(), SaveOutcome::VersionConflict);
        assert_eq!(repo.load("T1").await.unwrap().unwrap().version, 1);
    }
}
