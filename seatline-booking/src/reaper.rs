use chrono::Utc;
use seatline_core::lock::parse_expiry_marker;
use seatline_core::{BookingStatus, ExpirySource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::manager::{BookingError, BookingLifecycleManager};

/// Listens for expired booking markers and moves the matching bookings to
/// `Late`. Each notification is handled on its own task so one slow store
/// round-trip does not hold up the rest.
///
/// Expiry notifications are fire-and-forget, so anything that expired while
/// the reaper was not subscribed is lost. Every (re)subscription and every
/// `sweep_interval` the reaper also expires Pending bookings older than the
/// hold window straight from the repository.
pub struct ExpirationReaper {
    manager: Arc<BookingLifecycleManager>,
    source: Arc<dyn ExpirySource>,
    retry_delay: Duration,
    sweep_interval: Duration,
}

impl ExpirationReaper {
    pub fn new(manager: Arc<BookingLifecycleManager>, source: Arc<dyn ExpirySource>) -> Self {
        Self {
            manager,
            source,
            retry_delay: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(60),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Booking expiration reaper started");
        let mut in_flight: JoinSet<()> = JoinSet::new();

        'subscribe: loop {
            if *shutdown.borrow() {
                break;
            }

            match self.source.subscribe().await {
                Ok(mut subscription) => {
                    info!("Subscribed to booking expiry notifications");
                    self.sweep_stale(&mut in_flight);
                    let mut sweep = tokio::time::interval_at(
                        Instant::now() + self.sweep_interval,
                        self.sweep_interval,
                    );
                    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => break 'subscribe,
                            _ = sweep.tick() => self.sweep_stale(&mut in_flight),
                            next = subscription.next_expired() => match next {
                                Some(key) => self.dispatch(&mut in_flight, key),
                                None => {
                                    warn!("Expiry subscription closed, resubscribing");
                                    break;
                                }
                            },
                            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                                if let Err(e) = joined {
                                    error!(error = %e, "Expiry task panicked");
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to subscribe to booking expiry notifications");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Expiry task panicked");
            }
        }
        info!("Booking expiration reaper stopped");
    }

    fn sweep_stale(&self, in_flight: &mut JoinSet<()>) {
        let manager = self.manager.clone();
        in_flight.spawn(async move {
            if let Err(e) = manager.expire_stale(Utc::now()).await {
                error!(error = %e, "Stale booking sweep failed");
            }
        });
    }

    fn dispatch(&self, in_flight: &mut JoinSet<()>, key: String) {
        let Some(booking_id) = parse_expiry_marker(&key) else {
            debug!(key, "Ignoring unrelated expired key");
            return;
        };

        let manager = self.manager.clone();
        in_flight.spawn(async move {
            match manager.expire_booking(&booking_id).await {
                Ok(BookingStatus::Late) => {}
                Ok(status) => debug!(booking_id = %booking_id, %status, "Expired marker for settled booking"),
                Err(BookingError::NotFound(_)) => {
                    warn!(booking_id = %booking_id, "Expired marker for unknown booking")
                }
                Err(e) => error!(booking_id = %booking_id, error = %e, "Failed to expire booking"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::PaymentContext;
    use crate::vnpay::{VnPayConfig, VnPayGateway};
    use seatline_core::memory::{InMemoryBookingRepository, InMemorySeatLockStore};
    use seatline_core::{ActorKind, Booking, BookingId, BookingRepository, CreateBookingRequest, Payment};
    use seatline_shared::{Masked, ReservationFact};

    fn manager_over(
        repo: Arc<InMemoryBookingRepository>,
        locks: Arc<InMemorySeatLockStore>,
    ) -> Arc<BookingLifecycleManager> {
        Arc::new(
            BookingLifecycleManager::new(
                repo,
                locks,
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
            )
            .with_hold_ttl(Duration::from_secs(60)),
        )
    }

    fn request(seat: &str) -> CreateBookingRequest {
        CreateBookingRequest {
            phone_number: Masked("0912345678".to_string()),
            email: None,
            customer_name: "Le Van C".to_string(),
            trip_id: "T1".to_string(),
            seat_numbers: vec![seat.to_string()],
            amount: 90_000,
            pick_up_point: None,
            drop_off_point: None,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for_status(manager: &BookingLifecycleManager, id: &BookingId, status: BookingStatus) {
        for _ in 0..100 {
            if manager.get_booking(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("booking {id} never reached {status}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_marker_moves_booking_to_late() {
        let locks = Arc::new(InMemorySeatLockStore::new());
        let manager = manager_over(Arc::new(InMemoryBookingRepository::new()), locks.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = ExpirationReaper::new(manager.clone(), locks.clone());
        let handle = tokio::spawn(reaper.run(shutdown_rx));
        // Let the reaper subscribe before anything expires.
        settle().await;

        let id = manager
            .create_booking(request("A3"), ActorKind::Customer, &PaymentContext::default())
            .await
            .unwrap()
            .booking
            .id;

        tokio::time::advance(Duration::from_secs(61)).await;
        locks.sweep().await;

        wait_for_status(&manager, &id, BookingStatus::Late).await;
        assert!(locks.locked_seats("T1").await.is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_booking_older_than_hold_is_reaped_on_startup() {
        let repo = Arc::new(InMemoryBookingRepository::new());
        let locks = Arc::new(InMemorySeatLockStore::new());
        let manager = manager_over(repo.clone(), locks.clone());

        // Its marker expired while no reaper was running.
        let seats = vec!["A3".to_string()];
        let mut booking = Booking::new(BookingId::generate(), &request("A3"), seats, ActorKind::Customer);
        booking.booking_time = Utc::now() - chrono::Duration::hours(2);
        let payment = Payment::for_booking(&booking, 90_000);
        let fact = ReservationFact::SeatsReserved {
            trip_id: "T1".to_string(),
            seats: vec!["A3".to_string()],
        };
        repo.insert(&booking, &payment, &fact).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(ExpirationReaper::new(manager.clone(), locks.clone()).run(shutdown_rx));

        wait_for_status(&manager, &booking.id, BookingStatus::Late).await;
        assert!(matches!(
            repo.recorded_facts().await.last(),
            Some(ReservationFact::SeatsReleased { seats, .. }) if seats == &vec!["A3".to_string()]
        ));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_resubscribes_after_connection_drop() {
        let locks = Arc::new(InMemorySeatLockStore::new());
        let manager = manager_over(Arc::new(InMemoryBookingRepository::new()), locks.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = ExpirationReaper::new(manager.clone(), locks.clone())
            .with_retry_delay(Duration::from_secs(1))
            .with_sweep_interval(Duration::from_secs(3600));
        let handle = tokio::spawn(reaper.run(shutdown_rx));
        settle().await;

        locks.disconnect_subscribers();
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        let id = manager
            .create_booking(request("A1"), ActorKind::Customer, &PaymentContext::default())
            .await
            .unwrap()
            .booking
            .id;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(locks.sweep().await, 2);

        wait_for_status(&manager, &id, BookingStatus::Late).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
