use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seatline_shared::ReservationFact;
use uuid::Uuid;

use crate::repository::RepositoryError;

/// A reservation fact waiting to be relayed to the trip side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub fact: ReservationFact,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(fact: ReservationFact) -> Self {
        Self {
            id: Uuid::new_v4(),
            fact,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unpublished entries, oldest first.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, RepositoryError>;

    async fn mark_published(&self, id: Uuid) -> Result<(), RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Broker rejected message for {topic}: {reason}")]
    Broker { topic: String, reason: String },
}

/// Durable, at-least-once channel towards the trip side.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError>;
}
