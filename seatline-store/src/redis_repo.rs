use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult};
use seatline_core::lock::{expiry_marker_key, seat_lock_key};
use seatline_core::{
    AcquireOutcome, BookingId, ExpirySource, ExpirySubscription, LockError, SeatLockStore,
};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

// Checks every key before writing any, so a batch is taken whole or not at
// all. Returns the 1-based index of the first held key, or 0 on success.
const ACQUIRE_SCRIPT: &str = r#"
    for i, key in ipairs(KEYS) do
        if redis.call("EXISTS", key) == 1 then
            return i
        end
    end
    for _, key in ipairs(KEYS) do
        redis.call("SET", key, ARGV[1], "EX", ARGV[2])
    end
    return 0
"#;

// Deletes keys still owned by ARGV[1]; an empty owner deletes unconditionally.
const RELEASE_SCRIPT: &str = r#"
    local released = 0
    for _, key in ipairs(KEYS) do
        if ARGV[1] == "" or redis.call("GET", key) == ARGV[1] then
            released = released + redis.call("DEL", key)
        end
    end
    return released
"#;

/// Seat locks and expiry markers in Redis. Every call is bounded by
/// `op_timeout`; a slow or unreachable server surfaces as [`LockError`] and
/// the booking request fails closed.
#[derive(Clone)]
pub struct RedisSeatLockStore {
    conn: MultiplexedConnection,
    op_timeout: Duration,
    acquire: redis::Script,
    release: redis::Script,
}

impl RedisSeatLockStore {
    pub async fn new(client: &redis::Client, op_timeout: Duration) -> Result<Self, redis::RedisError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            op_timeout,
            acquire: redis::Script::new(ACQUIRE_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, LockError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(|e| LockError::Unavailable(e.to_string())),
            Err(_) => Err(LockError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl SeatLockStore for RedisSeatLockStore {
    async fn try_acquire(
        &self,
        trip_id: &str,
        seats: &[String],
        booking_id: &BookingId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, LockError> {
        if seats.is_empty() {
            return Ok(AcquireOutcome::Acquired);
        }

        let mut invocation = self.acquire.prepare_invoke();
        for seat in seats {
            invocation.key(seat_lock_key(trip_id, seat));
        }
        invocation.arg(booking_id.as_str()).arg(ttl.as_secs().max(1));

        let mut conn = self.conn.clone();
        let held: usize = self.bounded(invocation.invoke_async(&mut conn)).await?;

        match held {
            0 => Ok(AcquireOutcome::Acquired),
            i => Ok(AcquireOutcome::Conflict(
                seats.get(i - 1).cloned().unwrap_or_default(),
            )),
        }
    }

    async fn lock_owner(&self, trip_id: &str, seat: &str) -> Result<Option<BookingId>, LockError> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = self.bounded(conn.get(seat_lock_key(trip_id, seat))).await?;
        Ok(owner.and_then(|raw| BookingId::parse(&raw).ok()))
    }

    async fn exists(&self, trip_id: &str, seat: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.exists(seat_lock_key(trip_id, seat))).await
    }

    async fn release(
        &self,
        trip_id: &str,
        seats: &[String],
        owner: Option<&BookingId>,
    ) -> Result<(), LockError> {
        if seats.is_empty() {
            return Ok(());
        }

        let mut invocation = self.release.prepare_invoke();
        for seat in seats {
            invocation.key(seat_lock_key(trip_id, seat));
        }
        invocation.arg(owner.map(BookingId::as_str).unwrap_or(""));

        let mut conn = self.conn.clone();
        let released: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        debug!(trip_id, released, "Seat locks released");
        Ok(())
    }

    async fn set_expiry_marker(&self, booking_id: &BookingId, ttl: Duration) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.set_ex::<_, _, ()>(
            expiry_marker_key(booking_id),
            booking_id.as_str(),
            ttl.as_secs().max(1),
        ))
        .await
    }

    async fn expiry_marker_exists(&self, booking_id: &BookingId) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.exists(expiry_marker_key(booking_id))).await
    }

    async fn release_booking_marker(&self, booking_id: &BookingId) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.del::<_, ()>(expiry_marker_key(booking_id))).await
    }
}

/// Key-expiry notifications from Redis keyspace events.
pub struct RedisExpirySource {
    client: redis::Client,
    db: i64,
}

impl RedisExpirySource {
    pub fn new(client: redis::Client, db: i64) -> Self {
        Self { client, db }
    }

    pub fn channel(&self) -> String {
        format!("__keyevent@{}__:expired", self.db)
    }

    /// Turns on expired-key events. Managed Redis often forbids CONFIG, in
    /// which case the setting must be applied out of band.
    pub async fn enable_notifications(&self) {
        match self.configure_notifications().await {
            Ok(()) => info!("Redis keyspace expiry notifications enabled"),
            Err(e) => warn!(error = %e, "Could not enable keyspace notifications, assuming preconfigured"),
        }
    }

    async fn configure_notifications(&self) -> RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await
    }
}

pub struct RedisExpirySubscription {
    messages: BoxStream<'static, String>,
}

#[async_trait]
impl ExpirySubscription for RedisExpirySubscription {
    async fn next_expired(&mut self) -> Option<String> {
        self.messages.next().await
    }
}

#[async_trait]
impl ExpirySource for RedisExpirySource {
    async fn subscribe(&self) -> Result<Box<dyn ExpirySubscription>, LockError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(self.channel())
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        let messages = pubsub
            .into_on_message()
            .filter_map(|msg| futures_util::future::ready(msg.get_payload::<String>().ok()))
            .boxed();

        Ok(Box::new(RedisExpirySubscription { messages }))
    }
}
