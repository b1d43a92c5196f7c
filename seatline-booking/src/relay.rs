use seatline_core::{EventPublisher, OutboxStore, PublishError, RepositoryError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Drains committed outbox rows onto the event channel, oldest first. All
/// facts share one topic keyed by trip, so commit order per trip is the order
/// consumers see. A row is only marked published after the broker
/// acknowledged it, so a crash between the two steps re-sends the fact and
/// consumers dedupe it by id.
pub struct OutboxRelay {
    outbox: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    batch_size: usize,
    poll_interval: Duration,
    waker: Arc<Notify>,
}

impl OutboxRelay {
    pub fn new(outbox: Arc<dyn OutboxStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            outbox,
            publisher,
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            waker: Arc::new(Notify::new()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Handle the booking manager uses to trigger an immediate drain.
    pub fn waker(&self) -> Arc<Notify> {
        self.waker.clone()
    }

    /// Publishes one batch. Stops at the first failure so ordering per trip is
    /// preserved; the failed row is retried on the next pass.
    pub async fn run_once(&self) -> Result<usize, RelayError> {
        let pending = self.outbox.fetch_pending(self.batch_size).await?;
        let mut published = 0;

        for entry in pending {
            self.publisher.publish(&entry).await?;
            self.outbox.mark_published(entry.id).await?;
            published += 1;
            debug!(fact_id = %entry.id, kind = entry.fact.kind(), "Relayed reservation fact");
        }

        Ok(published)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(batch_size = self.batch_size, "Outbox relay started");

        loop {
            match self.run_once().await {
                // A full batch means more rows are probably waiting.
                Ok(n) if n == self.batch_size => continue,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Outbox relay pass failed, will retry"),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.waker.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{BookingLifecycleManager, PaymentContext};
    use crate::vnpay::{VnPayConfig, VnPayGateway};
    use seatline_core::memory::{InMemoryBookingRepository, InMemoryEventBus, InMemorySeatLockStore};
    use seatline_core::{ActorKind, Booking, BookingId, BookingRepository, CreateBookingRequest, Payment};
    use seatline_shared::models::events::{
        KIND_SEATS_RELEASED, KIND_SEATS_RESERVED, TOPIC_RESERVATION_FACTS,
    };
    use seatline_shared::{Masked, ReservationFact};

    async fn seed(repo: &InMemoryBookingRepository, trip: &str, seat: &str) {
        let request = CreateBookingRequest {
            phone_number: Masked("0900000000".to_string()),
            email: None,
            customer_name: "Pham D".to_string(),
            trip_id: trip.to_string(),
            seat_numbers: vec![seat.to_string()],
            amount: 100_000,
            pick_up_point: None,
            drop_off_point: None,
        };
        let booking = Booking::new(BookingId::generate(), &request, vec![seat.to_string()], ActorKind::Staff);
        let payment = Payment::for_booking(&booking, request.amount);
        let fact = ReservationFact::SeatsReserved {
            trip_id: trip.to_string(),
            seats: vec![seat.to_string()],
        };
        repo.insert(&booking, &payment, &fact).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_once_publishes_in_order_and_marks_rows() {
        let repo = Arc::new(InMemoryBookingRepository::new());
        let bus = Arc::new(InMemoryEventBus::new());
        seed(&repo, "T1", "A1").await;
        seed(&repo, "T2", "B1").await;

        let relay = OutboxRelay::new(repo.clone(), bus.clone());
        assert_eq!(relay.run_once().await.unwrap(), 2);
        assert_eq!(relay.run_once().await.unwrap(), 0);

        let keys: Vec<String> = bus.published().await.into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["T1", "T2"]);
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_rows_pending() {
        let repo = Arc::new(InMemoryBookingRepository::new());
        let bus = Arc::new(InMemoryEventBus::new());
        seed(&repo, "T1", "A1").await;

        let relay = OutboxRelay::new(repo.clone(), bus.clone());
        bus.set_failing(true);
        assert!(matches!(relay.run_once().await, Err(RelayError::Publish(_))));
        assert!(bus.published().await.is_empty());

        bus.set_failing(false);
        assert_eq!(relay.run_once().await.unwrap(), 1);
        assert_eq!(bus.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_expire_then_rebook_is_relayed_in_commit_order() {
        let repo = Arc::new(InMemoryBookingRepository::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let manager = BookingLifecycleManager::new(
            repo.clone(),
            Arc::new(InMemorySeatLockStore::new()),
            Arc::new(VnPayGateway::new(VnPayConfig {
                tmn_code: "TESTCODE".to_string(),
                hash_secret: Masked("secret".to_string()),
                pay_url: "https://pay.example".to_string(),
                return_url: "http://localhost/return".to_string(),
                version: "2.1.0".to_string(),
                currency: "VND".to_string(),
                order_type: "other".to_string(),
                payment_window: Duration::from_secs(900),
            })),
        );
        let request = CreateBookingRequest {
            phone_number: Masked("0900000000".to_string()),
            email: None,
            customer_name: "Pham D".to_string(),
            trip_id: "T1".to_string(),
            seat_numbers: vec!["A1".to_string()],
            amount: 100_000,
            pick_up_point: None,
            drop_off_point: None,
        };

        let first = manager
            .create_booking(request.clone(), ActorKind::Customer, &PaymentContext::default())
            .await
            .unwrap();
        manager.expire_booking(&first.booking.id).await.unwrap();
        manager
            .create_booking(request, ActorKind::Customer, &PaymentContext::default())
            .await
            .unwrap();

        let relay = OutboxRelay::new(repo.clone(), bus.clone());
        assert_eq!(relay.run_once().await.unwrap(), 3);

        let published = bus.published().await;
        assert!(published.iter().all(|m| m.topic == TOPIC_RESERVATION_FACTS && m.key == "T1"));
        let kinds: Vec<&str> = published.iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(kinds, vec![KIND_SEATS_RESERVED, KIND_SEATS_RELEASED, KIND_SEATS_RESERVED]);
    }
}
