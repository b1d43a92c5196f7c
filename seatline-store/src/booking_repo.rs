use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seatline_core::{
    Booking, BookingId, BookingRepository, OutboxEntry, OutboxStore, Payment, RepositoryError,
    SeatMove, Transition,
};
use seatline_shared::{Masked, ReservationFact};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

const PAYMENT_COLUMNS: &str = "id, booking_id, amount, payment_time, status, method";

const BOOKING_COLUMNS: &str = "id, phone_number, email, customer_name, trip_id, seat_numbers, \
     booking_time, status, pick_up_point, drop_off_point";

/// Bookings, payments and the outbox share one database, so every booking
/// change and the fact describing it commit together.
pub struct PgBookingRepository {
    pool: PgPool,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: String,
    phone_number: String,
    email: Option<String>,
    customer_name: String,
    trip_id: String,
    seat_numbers: Vec<String>,
    booking_time: DateTime<Utc>,
    status: String,
    pick_up_point: Option<String>,
    drop_off_point: Option<String>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = RepositoryError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: BookingId::parse(&row.id).map_err(corrupt)?,
            phone_number: Masked(row.phone_number),
            email: row.email,
            customer_name: row.customer_name,
            trip_id: row.trip_id,
            seat_numbers: row.seat_numbers,
            booking_time: row.booking_time,
            status: row.status.parse().map_err(corrupt)?,
            pick_up_point: row.pick_up_point,
            drop_off_point: row.drop_off_point,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    booking_id: String,
    amount: i64,
    payment_time: DateTime<Utc>,
    status: String,
    method: String,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = RepositoryError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            booking_id: BookingId::parse(&row.booking_id).map_err(corrupt)?,
            amount: row.amount,
            payment_time: row.payment_time,
            status: row.status.parse().map_err(corrupt)?,
            method: row.method.parse().map_err(corrupt)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    fact: Json<ReservationFact>,
    created_at: DateTime<Utc>,
}

fn backend(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend(e.to_string())
}

fn corrupt(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Corrupt(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

async fn insert_fact(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    fact: &ReservationFact,
) -> Result<(), RepositoryError> {
    let entry = OutboxEntry::new(fact.clone());
    sqlx::query(
        "INSERT INTO outbox (id, topic, partition_key, fact, created_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(entry.id)
    .bind(fact.topic())
    .bind(fact.partition_key())
    .bind(Json(&entry.fact))
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await
    .map_err(backend)?;
    Ok(())
}

fn into_bookings(rows: Vec<BookingRow>) -> Result<Vec<Booking>, RepositoryError> {
    rows.into_iter().map(Booking::try_from).collect()
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn insert(
        &self,
        booking: &Booking,
        payment: &Payment,
        fact: &ReservationFact,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query(
            r#"
            INSERT INTO bookings (id, phone_number, email, customer_name, trip_id, seat_numbers,
                                  booking_time, status, pick_up_point, drop_off_point)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(booking.id.as_str())
        .bind(booking.phone_number.expose())
        .bind(&booking.email)
        .bind(&booking.customer_name)
        .bind(&booking.trip_id)
        .bind(&booking.seat_numbers)
        .bind(booking.booking_time)
        .bind(booking.status.as_str())
        .bind(&booking.pick_up_point)
        .bind(&booking.drop_off_point)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Duplicate(booking.id.to_string())
            } else {
                backend(e)
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO payments (id, booking_id, amount, payment_time, status, method)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(payment.id)
        .bind(payment.booking_id.as_str())
        .bind(payment.amount)
        .bind(payment.payment_time)
        .bind(payment.status.as_str())
        .bind(payment.method.as_str())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        insert_fact(&mut tx, fact).await?;

        tx.commit().await.map_err(backend)
    }

    async fn get(&self, id: &BookingId) -> Result<Option<Booking>, RepositoryError> {
        let row: Option<BookingRow> =
            sqlx::query_as(&format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;

        row.map(Booking::try_from).transpose()
    }

    async fn find_by_trip(&self, trip_id: &str) -> Result<Vec<Booking>, RepositoryError> {
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bookings WHERE trip_id = $1 ORDER BY booking_time",
            BOOKING_COLUMNS
        ))
        .bind(trip_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        into_bookings(rows)
    }

    async fn find_by_phone(&self, phone_number: &str) -> Result<Vec<Booking>, RepositoryError> {
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bookings WHERE phone_number = $1 ORDER BY booking_time",
            BOOKING_COLUMNS
        ))
        .bind(phone_number)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        into_bookings(rows)
    }

    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Booking>, RepositoryError> {
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bookings WHERE status = 'Pending' AND booking_time < $1 \
             ORDER BY booking_time LIMIT $2",
            BOOKING_COLUMNS
        ))
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        into_bookings(rows)
    }

    async fn transition(
        &self,
        id: &BookingId,
        transition: Transition<'_>,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // A NULL holding skips the seat guard.
        let updated = sqlx::query(
            r#"
            UPDATE bookings SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = $3
              AND ($4::TEXT IS NULL OR (trip_id = $4 AND seat_numbers = $5))
            "#,
        )
        .bind(transition.to.as_str())
        .bind(id.as_str())
        .bind(transition.from.as_str())
        .bind(transition.holding.map(|held| held.trip_id))
        .bind(transition.holding.map(|held| held.seats.to_vec()))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(backend)?;
            return Ok(false);
        }

        if let Some(update) = transition.payment {
            sqlx::query(
                r#"
                UPDATE payments
                SET status = $1, method = COALESCE($2, method), payment_time = NOW()
                WHERE booking_id = $3
                "#,
            )
            .bind(update.status.as_str())
            .bind(update.method.map(|m| m.as_str()))
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        if let Some(fact) = transition.fact {
            insert_fact(&mut tx, fact).await?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(true)
    }

    async fn move_seats(&self, id: &BookingId, change: SeatMove<'_>) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let updated = sqlx::query(
            r#"
            UPDATE bookings SET trip_id = $1, seat_numbers = $2, updated_at = NOW()
            WHERE id = $3 AND status = $4 AND trip_id = $5 AND seat_numbers = $6
            "#,
        )
        .bind(change.trip_id)
        .bind(change.seats.to_vec())
        .bind(id.as_str())
        .bind(change.expected.as_str())
        .bind(change.from.trip_id)
        .bind(change.from.seats.to_vec())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(backend)?;
            return Ok(false);
        }

        for fact in change.facts {
            insert_fact(&mut tx, fact).await?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(true)
    }

    async fn get_payment(&self, booking_id: &BookingId) -> Result<Option<Payment>, RepositoryError> {
        let row: Option<PaymentRow> =
            sqlx::query_as(&format!("SELECT {} FROM payments WHERE booking_id = $1", PAYMENT_COLUMNS))
                .bind(booking_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;

        row.map(Payment::try_from).transpose()
    }

    async fn get_payment_by_id(&self, payment_id: Uuid) -> Result<Option<Payment>, RepositoryError> {
        let row: Option<PaymentRow> =
            sqlx::query_as(&format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS))
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;

        row.map(Payment::try_from).transpose()
    }

    async fn fail_payment(&self, booking_id: &BookingId) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            r#"
            UPDATE payments SET status = 'Failed', payment_time = NOW()
            WHERE booking_id = $1 AND status NOT IN ('Success', 'Failed')
            "#,
        )
        .bind(booking_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(updated.rows_affected() > 0)
    }
}

#[async_trait]
impl OutboxStore for PgBookingRepository {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            "SELECT id, fact, created_at FROM outbox WHERE published_at IS NULL ORDER BY seq LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows
            .into_iter()
            .map(|row| OutboxEntry {
                id: row.id,
                fact: row.fact.0,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE outbox SET published_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
