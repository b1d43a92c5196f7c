use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::booking::{Booking, BookingId, BookingStatus};
use crate::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Waiting,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, PaymentStatus::Success | PaymentStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "Pending",
            PaymentStatus::Waiting => "Waiting",
            PaymentStatus::Success => "Success",
            PaymentStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(PaymentStatus::Pending),
            "Waiting" => Ok(PaymentStatus::Waiting),
            "Success" => Ok(PaymentStatus::Success),
            "Failed" => Ok(PaymentStatus::Failed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Vnpay,
    Momo,
    Cash,
    Unknown,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Vnpay => "VNPAY",
            PaymentMethod::Momo => "MOMO",
            PaymentMethod::Cash => "CASH",
            PaymentMethod::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VNPAY" => Ok(PaymentMethod::Vnpay),
            "MOMO" => Ok(PaymentMethod::Momo),
            "CASH" => Ok(PaymentMethod::Cash),
            "UNKNOWN" => Ok(PaymentMethod::Unknown),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: BookingId,
    pub amount: i64,
    pub payment_time: DateTime<Utc>,
    pub status: PaymentStatus,
    pub method: PaymentMethod,
}

impl Payment {
    /// Counter bookings are paid in cash on the spot; customer bookings wait
    /// for the gateway.
    pub fn for_booking(booking: &Booking, amount: i64) -> Self {
        let (status, method) = match booking.status {
            BookingStatus::Pending => (PaymentStatus::Waiting, PaymentMethod::Unknown),
            _ => (PaymentStatus::Pending, PaymentMethod::Cash),
        };
        Self {
            id: Uuid::new_v4(),
            booking_id: booking.id.clone(),
            amount,
            payment_time: Utc::now(),
            status,
            method,
        }
    }
}

/// Payment change applied in the same write as a booking transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub method: Option<PaymentMethod>,
}

impl PaymentUpdate {
    pub fn succeeded(method: PaymentMethod) -> Self {
        Self { status: PaymentStatus::Success, method: Some(method) }
    }

    pub fn failed() -> Self {
        Self { status: PaymentStatus::Failed, method: None }
    }
}
