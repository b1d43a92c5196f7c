use anyhow::Context;
use seatline_api::{app, gateway_config, init_tracing, shutdown_signal, AppState};
use seatline_booking::{BookingLifecycleManager, ExpirationReaper, OutboxRelay, VnPayGateway};
use seatline_store::{DbClient, EventProducer, PgBookingRepository, RedisExpirySource, RedisSeatLockStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("seatline_api=debug,seatline_booking=debug,tower_http=debug,axum::rejection=trace");

    let config = seatline_store::app_config::Config::load().context("Failed to load config")?;
    tracing::info!("Starting Seatline API on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database.url)
        .await
        .context("Failed to connect to the booking database")?;
    db.migrate_booking().await.context("Booking migrations failed")?;
    let repo = Arc::new(PgBookingRepository::new(db.pool.clone()));

    // Redis
    let redis_client = redis::Client::open(config.redis.url.as_str()).context("Invalid Redis URL")?;
    let locks = RedisSeatLockStore::new(&redis_client, config.redis.op_timeout())
        .await
        .context("Failed to connect to Redis")?;
    let expiries = RedisExpirySource::new(redis_client, config.redis.db);
    expiries.enable_notifications().await;

    // Kafka
    let producer = EventProducer::new(&config.kafka.brokers).context("Failed to create Kafka producer")?;

    let relay = OutboxRelay::new(repo.clone(), Arc::new(producer))
        .with_batch_size(config.business_rules.outbox_batch_size)
        .with_poll_interval(config.business_rules.outbox_poll_interval());

    let hold = config.business_rules.seat_hold();
    let gateway = Arc::new(VnPayGateway::new(gateway_config(&config.vnpay, hold)));
    let manager = Arc::new(
        BookingLifecycleManager::new(repo, Arc::new(locks), gateway)
            .with_hold_ttl(hold)
            .with_outbox_waker(relay.waker()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = ExpirationReaper::new(manager.clone(), Arc::new(expiries))
        .with_sweep_interval(config.business_rules.stale_sweep_interval());
    let reaper = tokio::spawn(reaper.run(shutdown_rx.clone()));
    let relay = tokio::spawn(relay.run(shutdown_rx));

    let app = app(AppState::new(manager));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = reaper.await {
        tracing::error!("Expiration reaper panicked: {}", e);
    }
    if let Err(e) = relay.await {
        tracing::error!("Outbox relay panicked: {}", e);
    }
    tracing::info!("Seatline API stopped");
    Ok(())
}
