use seatline_booking::{BookingLifecycleManager, PaymentService};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<BookingLifecycleManager>,
    pub payments: Arc<PaymentService>,
}

impl AppState {
    pub fn new(bookings: Arc<BookingLifecycleManager>) -> Self {
        let payments = Arc::new(PaymentService::new(bookings.clone()));
        Self { bookings, payments }
    }
}
