//! Booking side of the reservation protocol: the lifecycle state machine,
//! the payment gateway adapter, the expiry reaper and the outbox relay.

pub mod manager;
pub mod payment;
pub mod reaper;
pub mod relay;
pub mod vnpay;

pub use manager::{BookingError, BookingLifecycleManager, BookingReceipt, PaymentContext};
pub use payment::{CallbackFlow, CallbackOutcome, PaymentService};
pub use reaper::ExpirationReaper;
pub use relay::{OutboxRelay, RelayError};
pub use vnpay::{GatewayError, VerifiedCallback, VnPayConfig, VnPayGateway, SECURE_HASH_FIELD};
