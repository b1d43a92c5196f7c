pub mod models;
pub mod pii;

pub use models::events::{FactDecodeError, ReservationFact};
pub use pii::Masked;
