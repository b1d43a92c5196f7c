use anyhow::Context;
use seatline_api::worker::{create_consumer, FactHandler, InventoryWorker, RetryPolicy};
use seatline_api::{init_tracing, shutdown_signal};
use seatline_inventory::SeatInventoryProjector;
use seatline_store::{DbClient, EventProducer, PgTripInventoryRepository};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("inventory_worker=debug,seatline_api=debug,seatline_inventory=debug");

    let config = seatline_store::app_config::Config::load().context("Failed to load config")?;

    let db = DbClient::new(config.database.trip_url())
        .await
        .context("Failed to connect to the trip database")?;
    db.migrate_trip().await.context("Trip migrations failed")?;

    let projector = Arc::new(SeatInventoryProjector::new(Arc::new(PgTripInventoryRepository::new(
        db.pool.clone(),
    ))));
    let dead_letters =
        Arc::new(EventProducer::new(&config.kafka.brokers).context("Failed to create Kafka producer")?);
    let consumer = create_consumer(&config.kafka.brokers, &config.kafka.group_id)
        .context("Failed to create Kafka consumer")?;

    let policy = RetryPolicy {
        max_attempts: config.business_rules.consumer_max_attempts,
        ..RetryPolicy::default()
    };
    let worker = InventoryWorker::new(consumer, FactHandler::new(projector, dead_letters, policy));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await.context("Inventory worker failed")?;
    Ok(())
}
