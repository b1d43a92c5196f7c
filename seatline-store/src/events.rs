use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use seatline_core::{EventPublisher, OutboxEntry, PublishError};
use seatline_shared::models::events::{FACT_KIND_HEADER, TOPIC_DEAD_LETTER};
use std::time::Duration;
use tracing::{error, info};

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()?;

        Ok(Self { producer })
    }

    /// Sends a raw payload and waits for the broker acknowledgement.
    pub async fn publish_raw(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: OwnedHeaders,
    ) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(headers);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!(
                    topic,
                    key,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Message delivered"
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!(topic, key, error = %e, "Failed to deliver message");
                Err(e)
            }
        }
    }

    /// Parks a message the consumer could not apply. The payload is kept
    /// byte-for-byte; the origin, fact kind and failure reason travel as
    /// headers.
    pub async fn publish_dead_letter(
        &self,
        source_topic: &str,
        kind: Option<&str>,
        key: &str,
        payload: &[u8],
        reason: &str,
    ) -> Result<(), rdkafka::error::KafkaError> {
        let mut headers = OwnedHeaders::new()
            .insert(Header { key: "source-topic", value: Some(source_topic) })
            .insert(Header { key: "error", value: Some(reason) });
        if let Some(kind) = kind {
            headers = headers.insert(Header { key: FACT_KIND_HEADER, value: Some(kind) });
        }

        self.publish_raw(TOPIC_DEAD_LETTER, key, payload, headers).await?;
        info!(source_topic, key, reason, "Message dead-lettered");
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for EventProducer {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError> {
        let topic = entry.fact.topic();
        let payload = entry.fact.encode(Some(entry.id))?;
        let headers = OwnedHeaders::new().insert(Header {
            key: FACT_KIND_HEADER,
            value: Some(entry.fact.kind()),
        });

        self.publish_raw(topic, entry.fact.partition_key(), payload.as_bytes(), headers)
            .await
            .map_err(|e| PublishError::Broker {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}
