use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use seatline_core::PublishError;
use seatline_inventory::{ApplyOutcome, SeatInventoryProjector};
use seatline_shared::models::events::{FACT_KIND_HEADER, TOPIC_DEAD_LETTER, TOPIC_RESERVATION_FACTS};
use seatline_shared::ReservationFact;
use seatline_store::EventProducer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// What became of one consumed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied(ApplyOutcome),
    DeadLetter(String),
}

/// Decodes and applies one message of the given fact kind. Permanent failures
/// go straight to the dead-letter topic; transient ones are retried with
/// linear backoff first.
pub async fn process_message(
    projector: &SeatInventoryProjector,
    kind: &str,
    payload: &str,
    policy: RetryPolicy,
) -> Disposition {
    let (fact_id, fact) = match ReservationFact::decode(kind, payload) {
        Ok(decoded) => decoded,
        Err(e) => return Disposition::DeadLetter(e.to_string()),
    };

    let mut attempt = 1;
    loop {
        match projector.apply_fact(fact_id, &fact).await {
            Ok(outcome) => return Disposition::Applied(outcome),
            Err(e) if e.is_permanent() => return Disposition::DeadLetter(e.to_string()),
            Err(e) if attempt >= policy.max_attempts => {
                return Disposition::DeadLetter(format!("gave up after {} attempts: {}", attempt, e));
            }
            Err(e) => {
                warn!(kind, attempt, error = %e, "Applying fact failed, retrying");
                sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
        }
    }
}

/// Where messages the worker cannot apply are parked.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn park(
        &self,
        source_topic: &str,
        kind: Option<&str>,
        key: &str,
        payload: &[u8],
        reason: &str,
    ) -> Result<(), PublishError>;
}

#[async_trait]
impl DeadLetterSink for EventProducer {
    async fn park(
        &self,
        source_topic: &str,
        kind: Option<&str>,
        key: &str,
        payload: &[u8],
        reason: &str,
    ) -> Result<(), PublishError> {
        self.publish_dead_letter(source_topic, kind, key, payload, reason)
            .await
            .map_err(|e| PublishError::Broker {
                topic: TOPIC_DEAD_LETTER.to_string(),
                reason: e.to_string(),
            })
    }
}

/// One consumed message, as read off the wire.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub topic: &'a str,
    pub kind: Option<&'a str>,
    pub key: &'a str,
    pub payload: Option<&'a [u8]>,
}

/// Applies deliveries to seat inventory and parks the ones that cannot be
/// applied, payload bytes untouched.
pub struct FactHandler {
    projector: Arc<SeatInventoryProjector>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
}

impl FactHandler {
    pub fn new(
        projector: Arc<SeatInventoryProjector>,
        dead_letters: Arc<dyn DeadLetterSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            projector,
            dead_letters,
            policy,
        }
    }

    /// Returns whether the delivery was applied or parked. `false` means
    /// shutdown interrupted parking and the offset must stay uncommitted.
    pub async fn handle(&self, delivery: Delivery<'_>, shutdown: &watch::Receiver<bool>) -> bool {
        let raw = delivery.payload.unwrap_or_default();
        let disposition = match (delivery.kind, std::str::from_utf8(raw)) {
            (None, _) => Disposition::DeadLetter(format!("missing {} header", FACT_KIND_HEADER)),
            (Some(_), Err(e)) => Disposition::DeadLetter(format!("payload is not UTF-8: {}", e)),
            (Some(_), Ok("")) => Disposition::DeadLetter("empty payload".to_string()),
            (Some(kind), Ok(payload)) => process_message(&self.projector, kind, payload, self.policy).await,
        };

        match disposition {
            Disposition::Applied(outcome) => {
                info!(kind = delivery.kind, key = delivery.key, ?outcome, "Fact processed");
                true
            }
            Disposition::DeadLetter(reason) => self.park(&delivery, raw, &reason, shutdown).await,
        }
    }

    /// Publishes to the dead-letter topic, retrying until it succeeds or
    /// shutdown is requested.
    async fn park(
        &self,
        delivery: &Delivery<'_>,
        payload: &[u8],
        reason: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> bool {
        warn!(topic = delivery.topic, key = delivery.key, reason, "Dead-lettering message");
        loop {
            match self
                .dead_letters
                .park(delivery.topic, delivery.kind, delivery.key, payload, reason)
                .await
            {
                Ok(()) => return true,
                Err(e) => {
                    error!(topic = delivery.topic, error = %e, "Dead-letter publish failed, retrying");
                    if *shutdown.borrow() {
                        return false;
                    }
                    sleep(self.policy.backoff).await;
                }
            }
        }
    }
}

pub fn create_consumer(brokers: &str, group_id: &str) -> Result<StreamConsumer, rdkafka::error::KafkaError> {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()
}

/// Trip-side consumer: applies reservation facts to seat inventory and
/// commits each offset only once the message is applied or parked.
pub struct InventoryWorker {
    consumer: StreamConsumer,
    handler: FactHandler,
}

impl InventoryWorker {
    pub fn new(consumer: StreamConsumer, handler: FactHandler) -> Self {
        Self { consumer, handler }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), rdkafka::error::KafkaError> {
        self.consumer.subscribe(&[TOPIC_RESERVATION_FACTS])?;
        info!("Inventory worker started, listening for reservation facts...");

        loop {
            let message = tokio::select! {
                _ = shutdown.changed() => break,
                message = self.consumer.recv() => message,
            };

            let m = match message {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, "Kafka error");
                    continue;
                }
            };

            let kind = m.headers().and_then(|headers| {
                headers
                    .iter()
                    .find(|header| header.key == FACT_KIND_HEADER)
                    .and_then(|header| header.value)
                    .and_then(|value| std::str::from_utf8(value).ok())
            });
            let delivery = Delivery {
                topic: m.topic(),
                kind,
                key: m.key_view::<str>().and_then(Result::ok).unwrap_or_default(),
                payload: m.payload(),
            };

            if !self.handler.handle(delivery, &shutdown).await {
                // Shutting down before the message was parked; leave it uncommitted.
                break;
            }
            debug!(partition = m.partition(), offset = m.offset(), "Committing offset");

            if let Err(e) = self.consumer.commit_message(&m, CommitMode::Async) {
                warn!(topic = m.topic(), error = %e, "Failed to commit offset");
            }
        }

        info!("Inventory worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seatline_core::memory::InMemoryTripInventoryRepository;
    use seatline_shared::models::events::KIND_SEATS_RESERVED;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Parked {
        source_topic: String,
        kind: Option<String>,
        key: String,
        payload: Vec<u8>,
        reason: String,
    }

    #[derive(Default)]
    struct RecordingSink {
        parked: Mutex<Vec<Parked>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn park(
            &self,
            source_topic: &str,
            kind: Option<&str>,
            key: &str,
            payload: &[u8],
            reason: &str,
        ) -> Result<(), PublishError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PublishError::Broker {
                    topic: TOPIC_DEAD_LETTER.to_string(),
                    reason: "broker down".to_string(),
                });
            }
            self.parked.lock().await.push(Parked {
                source_topic: source_topic.to_string(),
                kind: kind.map(str::to_string),
                key: key.to_string(),
                payload: payload.to_vec(),
                reason: reason.to_string(),
            });
            Ok(())
        }
    }

    async fn handler(sink: Arc<RecordingSink>) -> FactHandler {
        FactHandler::new(Arc::new(projector().await), sink, no_wait())
    }

    fn delivery<'a>(kind: Option<&'a str>, payload: &'a [u8]) -> Delivery<'a> {
        Delivery {
            topic: TOPIC_RESERVATION_FACTS,
            kind,
            key: "T1",
            payload: Some(payload),
        }
    }

    async fn projector() -> SeatInventoryProjector {
        let repo = Arc::new(InMemoryTripInventoryRepository::new());
        repo.insert_trip("T1", 2).await;
        SeatInventoryProjector::new(repo)
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_redelivered_message_is_applied_once() {
        let projector = projector().await;
        let fact_id = Uuid::new_v4();
        let payload = ReservationFact::SeatsReserved {
            trip_id: "T1".to_string(),
            seats: vec!["A1".to_string()],
        }
        .encode(Some(fact_id))
        .unwrap();

        let first = process_message(&projector, KIND_SEATS_RESERVED, &payload, no_wait()).await;
        let second = process_message(&projector, KIND_SEATS_RESERVED, &payload, no_wait()).await;

        assert_eq!(first, Disposition::Applied(ApplyOutcome::Applied));
        assert_eq!(second, Disposition::Applied(ApplyOutcome::Duplicate));
        assert_eq!(projector.inventory("T1").await.unwrap().available(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_dead_lettered() {
        let projector = projector().await;

        let garbage = process_message(&projector, KIND_SEATS_RESERVED, "{not json", no_wait()).await;
        assert!(matches!(garbage, Disposition::DeadLetter(_)));

        let oversold = ReservationFact::SeatsReserved {
            trip_id: "T1".to_string(),
            seats: vec!["A1".to_string(), "A2".to_string(), "A3".to_string()],
        }
        .encode(None)
        .unwrap();
        let disposition = process_message(&projector, KIND_SEATS_RESERVED, &oversold, no_wait()).await;
        assert!(matches!(disposition, Disposition::DeadLetter(ref reason) if reason.contains("Oversold")));
        assert_eq!(projector.inventory("T1").await.unwrap().available(), 2);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_dead_lettered() {
        let projector = projector().await;
        let disposition = process_message(&projector, "booking.route.unknown", "{}", no_wait()).await;
        assert!(matches!(disposition, Disposition::DeadLetter(_)));
    }

    #[tokio::test]
    async fn test_unreadable_payload_is_parked_byte_for_byte() {
        let sink = Arc::new(RecordingSink::default());
        let handler = handler(sink.clone()).await;
        let (_tx, shutdown) = watch::channel(false);
        let raw: &[u8] = &[0xff, 0xfe, b'{', 0x00];

        assert!(handler.handle(delivery(Some(KIND_SEATS_RESERVED), raw), &shutdown).await);

        let parked = sink.parked.lock().await.clone();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].payload, raw.to_vec());
        assert_eq!(parked[0].source_topic, TOPIC_RESERVATION_FACTS);
        assert_eq!(parked[0].kind.as_deref(), Some(KIND_SEATS_RESERVED));
        assert_eq!(parked[0].key, "T1");
        assert!(parked[0].reason.contains("UTF-8"));
    }

    #[tokio::test]
    async fn test_message_without_kind_is_parked() {
        let sink = Arc::new(RecordingSink::default());
        let handler = handler(sink.clone()).await;
        let (_tx, shutdown) = watch::channel(false);
        let payload = br#"{"TripId":"T1","SeatNumbers":["A1"]}"#;

        assert!(handler.handle(delivery(None, payload), &shutdown).await);

        let parked = sink.parked.lock().await.clone();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].payload, payload.to_vec());
        assert!(parked[0].reason.contains(FACT_KIND_HEADER));
    }

    #[tokio::test]
    async fn test_applied_delivery_is_not_parked() {
        let sink = Arc::new(RecordingSink::default());
        let handler = handler(sink.clone()).await;
        let (_tx, shutdown) = watch::channel(false);
        let payload = ReservationFact::SeatsReserved {
            trip_id: "T1".to_string(),
            seats: vec!["A1".to_string()],
        }
        .encode(Some(Uuid::new_v4()))
        .unwrap();

        assert!(handler.handle(delivery(Some(KIND_SEATS_RESERVED), payload.as_bytes()), &shutdown).await);
        assert!(sink.parked.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_parking_gives_up_on_shutdown() {
        let sink = Arc::new(RecordingSink::default());
        sink.failing.store(true, Ordering::SeqCst);
        let handler = handler(sink.clone()).await;
        let (tx, shutdown) = watch::channel(false);
        tx.send(true).unwrap();

        assert!(!handler.handle(delivery(Some(KIND_SEATS_RESERVED), b"{not json"), &shutdown).await);
        assert!(sink.parked.lock().await.is_empty());
    }
}
