use seatline_core::{Booking, BookingId, BookingStatus};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::manager::{BookingError, BookingLifecycleManager};

/// Which gateway callback delivered the result. Both carry the same signed
/// fields; the return flow is the browser redirect, the IPN is server-to-server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFlow {
    Return,
    Ipn,
}

impl fmt::Display for CallbackFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackFlow::Return => f.write_str("return"),
            CallbackFlow::Ipn => f.write_str("ipn"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Confirmed(Booking),
    /// Repeat delivery for a booking that is already paid.
    AlreadyConfirmed(Booking),
    Declined {
        booking_id: BookingId,
        response_code: String,
    },
}

pub struct PaymentService {
    manager: Arc<BookingLifecycleManager>,
}

impl PaymentService {
    pub fn new(manager: Arc<BookingLifecycleManager>) -> Self {
        Self { manager }
    }

    /// Verifies a gateway callback and applies its result to the booking.
    /// Nothing is changed unless the signature checks out.
    pub async fn handle_callback(
        &self,
        params: &HashMap<String, String>,
        flow: CallbackFlow,
    ) -> Result<CallbackOutcome, BookingError> {
        let verified = self.manager.gateway().verify_callback(params).map_err(|e| {
            warn!(%flow, error = %e, "Rejected payment callback");
            e
        })?;

        let txn_ref = verified
            .txn_ref()
            .ok_or_else(|| BookingError::Validation("Missing vnp_TxnRef".to_string()))?;
        let booking_id = BookingId::parse(txn_ref)?;

        if verified.is_success() {
            return match self.manager.confirm_payment(&booking_id).await {
                Ok(booking) => {
                    info!(%flow, booking_id = %booking_id, "Payment callback confirmed booking");
                    Ok(CallbackOutcome::Confirmed(booking))
                }
                Err(BookingError::InvalidStatus {
                    from: BookingStatus::Booked,
                    ..
                }) => {
                    let booking = self.manager.get_booking(&booking_id).await?;
                    Ok(CallbackOutcome::AlreadyConfirmed(booking))
                }
                Err(e) => Err(e),
            };
        }

        let response_code = verified.response_code().unwrap_or_default().to_string();
        self.manager.record_payment_failure(&booking_id).await?;
        info!(%flow, booking_id = %booking_id, response_code, "Payment declined by gateway");
        Ok(CallbackOutcome::Declined {
            booking_id,
            response_code,
        })
    }
}
