use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    /// Bookings, payments and the outbox.
    pub async fn migrate_booking(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running booking database migrations...");
        let mut migrator = sqlx::migrate!("../migrations/booking");
        // Both migration sets may share one database in development.
        migrator.set_ignore_missing(true);
        migrator.run(&self.pool).await?;
        info!("Booking migrations completed successfully.");
        Ok(())
    }

    /// Trip seat inventory and the processed-facts ledger.
    pub async fn migrate_trip(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running trip database migrations...");
        let mut migrator = sqlx::migrate!("../migrations/trip");
        migrator.set_ignore_missing(true);
        migrator.run(&self.pool).await?;
        info!("Trip migrations completed successfully.");
        Ok(())
    }
}
