pub mod projector;

pub use projector::{ApplyOutcome, InventoryError, SeatInventoryProjector};
