use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::repository::RepositoryError;

/// Trip-side seat counters. `version` is bumped on every committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripSeatInventory {
    pub trip_id: String,
    pub capacity: u32,
    pub booked_seats: BTreeSet<String>,
    pub version: i64,
}

impl TripSeatInventory {
    pub fn new(trip_id: impl Into<String>, capacity: u32) -> Self {
        Self {
            trip_id: trip_id.into(),
            capacity,
            booked_seats: BTreeSet::new(),
            version: 0,
        }
    }

    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.booked_seats.len() as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    VersionConflict,
}

#[async_trait]
pub trait TripInventoryRepository: Send + Sync {
    async fn load(&self, trip_id: &str) -> Result<Option<TripSeatInventory>, RepositoryError>;

    /// Conditional write: succeeds only if the stored version still equals
    /// `inventory.version`.
    async fn save(&self, inventory: &TripSeatInventory) -> Result<SaveOutcome, RepositoryError>;

    async fn is_processed(&self, fact_id: Uuid) -> Result<bool, RepositoryError>;

    async fn mark_processed(&self, fact_id: Uuid) -> Result<(), RepositoryError>;
}
