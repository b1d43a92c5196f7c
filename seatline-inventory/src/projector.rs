use seatline_core::{RepositoryError, SaveOutcome, TripInventoryRepository, TripSeatInventory};
use seatline_shared::ReservationFact;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The fact was valid but the booked set already reflected it.
    Unchanged,
    /// The fact id was processed before.
    Duplicate,
}

/// Applies reservation facts to the trip-side seat counters. All writes go
/// through the repository's versioned save, so concurrent consumers never
/// overwrite each other.
pub struct SeatInventoryProjector {
    trips: Arc<dyn TripInventoryRepository>,
    max_attempts: usize,
}

impl SeatInventoryProjector {
    pub fn new(trips: Arc<dyn TripInventoryRepository>) -> Self {
        Self {
            trips,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn inventory(&self, trip_id: &str) -> Result<TripSeatInventory, InventoryError> {
        self.trips
            .load(trip_id)
            .await?
            .ok_or_else(|| InventoryError::NotFound(trip_id.to_string()))
    }

    /// Adds `seats` to the trip's booked set. Rejected as a whole if the
    /// result would exceed capacity.
    pub async fn apply_reserved(&self, trip_id: &str, seats: &[String]) -> Result<ApplyOutcome, InventoryError> {
        self.update(trip_id, |inventory| {
            let mut booked = inventory.booked_seats.clone();
            booked.extend(seats.iter().cloned());
            if booked.len() == inventory.booked_seats.len() {
                return Ok(None);
            }
            if booked.len() > inventory.capacity as usize {
                return Err(InventoryError::Oversold {
                    trip_id: trip_id.to_string(),
                    requested: booked.len() - inventory.booked_seats.len(),
                    available: inventory.available(),
                });
            }
            Ok(Some(booked))
        })
        .await
    }

    /// Removes `seats` from the booked set; seats that are not booked are ignored.
    pub async fn apply_released(&self, trip_id: &str, seats: &[String]) -> Result<ApplyOutcome, InventoryError> {
        self.update(trip_id, |inventory| {
            let mut booked = inventory.booked_seats.clone();
            for seat in seats {
                booked.remove(seat);
            }
            if booked.len() == inventory.booked_seats.len() {
                Ok(None)
            } else {
                Ok(Some(booked))
            }
        })
        .await
    }

    /// Applies one fact from the event channel, skipping it if `fact_id` was
    /// already processed. The id is recorded only after the fact applied.
    pub async fn apply_fact(
        &self,
        fact_id: Option<Uuid>,
        fact: &ReservationFact,
    ) -> Result<ApplyOutcome, InventoryError> {
        if let Some(id) = fact_id {
            if self.trips.is_processed(id).await? {
                debug!(fact_id = %id, "Skipping already processed fact");
                return Ok(ApplyOutcome::Duplicate);
            }
        }

        let outcome = match fact {
            ReservationFact::SeatsReserved { trip_id, seats } => self.apply_reserved(trip_id, seats).await?,
            ReservationFact::SeatsReleased { trip_id, seats } => self.apply_released(trip_id, seats).await?,
            ReservationFact::SeatsMoved {
                old_trip_id,
                old_seats,
                new_trip_id,
                new_seats,
            } => {
                let released = self.apply_released(old_trip_id, old_seats).await?;
                let reserved = self.apply_reserved(new_trip_id, new_seats).await?;
                if released == ApplyOutcome::Applied || reserved == ApplyOutcome::Applied {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Unchanged
                }
            }
        };

        if let Some(id) = fact_id {
            self.trips.mark_processed(id).await?;
        }
        Ok(outcome)
    }

    async fn update<F>(&self, trip_id: &str, mut mutate: F) -> Result<ApplyOutcome, InventoryError>
    where
        F: FnMut(&TripSeatInventory) -> Result<Option<BTreeSet<String>>, InventoryError>,
    {
        for attempt in 1..=self.max_attempts {
            let mut inventory = self.inventory(trip_id).await?;
            let Some(booked) = mutate(&inventory)? else {
                return Ok(ApplyOutcome::Unchanged);
            };
            inventory.booked_seats = booked;

            match self.trips.save(&inventory).await? {
                SaveOutcome::Saved => {
                    info!(
                        trip_id,
                        booked = inventory.booked_seats.len(),
                        available = inventory.available(),
                        "Trip inventory updated"
                    );
                    return Ok(ApplyOutcome::Applied);
                }
                SaveOutcome::VersionConflict => {
                    warn!(trip_id, attempt, "Trip inventory version conflict, retrying");
                }
            }
        }

        Err(InventoryError::Contention {
            trip_id: trip_id.to_string(),
            attempts: self.max_attempts,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Trip inventory not found: {0}")]
    NotFound(String),

    #[error("Oversold on trip {trip_id}: requested {requested}, available {available}")]
    Oversold {
        trip_id: String,
        requested: usize,
        available: u32,
    },

    #[error("Trip {trip_id} still contended after {attempts} attempts")]
    Contention { trip_id: String, attempts: usize },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl InventoryError {
    /// Errors that will fail the same way on every redelivery.
    pub fn is_permanent(&self) -> bool {
        matches!(self, InventoryError::NotFound(_) | InventoryError::Oversold { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use seatline_core::memory::InMemoryTripInventoryRepository;

    fn seats(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    async fn projector_with_trip(trip: &str, capacity: u32) -> SeatInventoryProjector {
        let repo = Arc::new(InMemoryTripInventoryRepository::new());
        repo.insert_trip(trip, capacity).await;
        SeatInventoryProjector::new(repo)
    }

    #[tokio::test]
    async fn test_reserve_then_release_restores_availability() {
        let projector = projector_with_trip("T1", 40).await;

        assert_eq!(projector.apply_reserved("T1", &seats(&["A1", "A2"])).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(projector.inventory("T1").await.unwrap().available(), 38);

        assert_eq!(projector.apply_reserved("T1", &seats(&["A2", "A1"])).await.unwrap(), ApplyOutcome::Unchanged);

        projector.apply_released("T1", &seats(&["A1", "A2", "Z9"])).await.unwrap();
        let inventory = projector.inventory("T1").await.unwrap();
        assert_eq!(inventory.available(), 40);
        assert!(inventory.booked_seats.is_empty());
    }

    #[tokio::test]
    async fn test_oversold_leaves_inventory_unchanged() {
        let projector = projector_with_trip("T2", 2).await;
        projector.apply_reserved("T2", &seats(&["A1"])).await.unwrap();

        let err = projector.apply_reserved("T2", &seats(&["A2", "A3"])).await.unwrap_err();
        assert!(matches!(err, InventoryError::Oversold { requested: 2, available: 1, .. }));
        assert!(err.is_permanent());

        let inventory = projector.inventory("T2").await.unwrap();
        assert_eq!(inventory.booked_seats.len(), 1);
        assert_eq!(inventory.version, 1);
    }

    #[tokio::test]
    async fn test_duplicate_fact_id_applies_once() {
        let projector = projector_with_trip("T1", 40).await;
        let fact_id = Uuid::new_v4();
        let reserved = ReservationFact::SeatsReserved {
            trip_id: "T1".to_string(),
            seats: seats(&["A1"]),
        };
        let released = ReservationFact::SeatsReleased {
            trip_id: "T1".to_string(),
            seats: seats(&["A1"]),
        };

        assert_eq!(projector.apply_fact(Some(fact_id), &reserved).await.unwrap(), ApplyOutcome::Applied);
        projector.apply_fact(Some(Uuid::new_v4()), &released).await.unwrap();
        // A redelivered reserve must not re-book the freed seat.
        assert_eq!(projector.apply_fact(Some(fact_id), &reserved).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(projector.inventory("T1").await.unwrap().available(), 40);
    }

    #[tokio::test]
    async fn test_moved_fact_updates_both_trips() {
        let repo = Arc::new(InMemoryTripInventoryRepository::new());
        repo.insert_trip("T1", 40).await;
        repo.insert_trip("T2", 40).await;
        let projector = SeatInventoryProjector::new(repo);
        projector.apply_reserved("T1", &seats(&["A1", "A2"])).await.unwrap();

        let moved = ReservationFact::SeatsMoved {
            old_trip_id: "T1".to_string(),
            old_seats: seats(&["A1", "A2"]),
            new_trip_id: "T2".to_string(),
            new_seats: seats(&["B4"]),
        };
        assert_eq!(projector.apply_fact(None, &moved).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(projector.inventory("T1").await.unwrap().available(), 40);
        assert_eq!(
            projector.inventory("T2").await.unwrap().booked_seats.into_iter().collect::<Vec<_>>(),
            vec!["B4"]
        );
    }

    #[tokio::test]
    async fn test_unknown_trip_is_not_found() {
        let projector = projector_with_trip("T1", 40).await;
        let err = projector.apply_reserved("T404", &seats(&["A1"])).await.unwrap_err();
        assert!(matches!(err, InventoryError::NotFound(ref trip) if trip == "T404"));
    }

    /// Loads fine but every save loses the version race.
    struct AlwaysConflicting;

    #[async_trait]
    impl TripInventoryRepository for AlwaysConflicting {
        async fn load(&self, trip_id: &str) -> Result<Option<TripSeatInventory>, RepositoryError> {
            Ok(Some(TripSeatInventory::new(trip_id, 40)))
        }

        async fn save(&self, _inventory: &TripSeatInventory) -> Result<SaveOutcome, RepositoryError> {
            Ok(SaveOutcome::VersionConflict)
        }

        async fn is_processed(&self, _fact_id: Uuid) -> Result<bool, RepositoryError> {
            Ok(false)
        }

        async fn mark_processed(&self, _fact_id: Uuid) -> Result<(), RepositoryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_version_conflicts_are_bounded() {
        let projector = SeatInventoryProjector::new(Arc::new(AlwaysConflicting)).with_max_attempts(3);
        let err = projector.apply_reserved("T1", &seats(&["A1"])).await.unwrap_err();
        assert!(matches!(err, InventoryError::Contention { attempts: 3, .. }));
        assert!(!err.is_permanent());
    }
}
