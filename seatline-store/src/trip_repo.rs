use async_trait::async_trait;
use seatline_core::{RepositoryError, SaveOutcome, TripInventoryRepository, TripSeatInventory};
use sqlx::PgPool;
use uuid::Uuid;

pub struct PgTripInventoryRepository {
    pool: PgPool,
}

impl PgTripInventoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TripInventoryRow {
    trip_id: String,
    capacity: i32,
    booked_seats: Vec<String>,
    version: i64,
}

fn backend(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend(e.to_string())
}

#[async_trait]
impl TripInventoryRepository for PgTripInventoryRepository {
    async fn load(&self, trip_id: &str) -> Result<Option<TripSeatInventory>, RepositoryError> {
        let row: Option<TripInventoryRow> = sqlx::query_as(
            "SELECT trip_id, capacity, booked_seats, version FROM trip_inventory WHERE trip_id = $1",
        )
        .bind(trip_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|row| {
            let capacity = u32::try_from(row.capacity)
                .map_err(|_| RepositoryError::Corrupt(format!("negative capacity for trip {}", row.trip_id)))?;
            Ok(TripSeatInventory {
                trip_id: row.trip_id,
                capacity,
                booked_seats: row.booked_seats.into_iter().collect(),
                version: row.version,
            })
        })
        .transpose()
    }

    async fn save(&self, inventory: &TripSeatInventory) -> Result<SaveOutcome, RepositoryError> {
        let booked: Vec<String> = inventory.booked_seats.iter().cloned().collect();
        let updated = sqlx::query(
            r#"
            UPDATE trip_inventory
            SET booked_seats = $1, available = $2, version = version + 1, updated_at = NOW()
            WHERE trip_id = $3 AND version = $4
            "#,
        )
        .bind(booked)
        .bind(inventory.available() as i32)
        .bind(&inventory.trip_id)
        .bind(inventory.version)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            Ok(SaveOutcome::VersionConflict)
        } else {
            Ok(SaveOutcome::Saved)
        }
    }

    async fn is_processed(&self, fact_id: Uuid) -> Result<bool, RepositoryError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM processed_facts WHERE fact_id = $1)")
                .bind(fact_id)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
        Ok(exists)
    }

    async fn mark_processed(&self, fact_id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO processed_facts (fact_id) VALUES ($1) ON CONFLICT (fact_id) DO NOTHING")
            .bind(fact_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
