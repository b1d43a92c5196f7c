use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every reservation fact travels on this one topic, keyed by trip, so a
/// trip's facts keep their commit order on a single partition.
pub const TOPIC_RESERVATION_FACTS: &str = "booking.route.seats";
pub const TOPIC_DEAD_LETTER: &str = "booking.route.dlq";

/// Message header naming which fact a payload carries.
pub const FACT_KIND_HEADER: &str = "fact-kind";

pub const KIND_SEATS_RESERVED: &str = "booking.route.created";
pub const KIND_SEATS_RELEASED: &str = "booking.route.cancelled";
pub const KIND_SEATS_MOVED: &str = "booking.route.changed";

/// Seat-reservation facts carried from the booking side to the trip side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReservationFact {
    SeatsReserved {
        trip_id: String,
        seats: Vec<String>,
    },
    SeatsReleased {
        trip_id: String,
        seats: Vec<String>,
    },
    /// A seat change within one trip. Changes across trips are recorded as a
    /// release and a reserve instead, see [`ReservationFact::for_seat_change`].
    SeatsMoved {
        old_trip_id: String,
        old_seats: Vec<String>,
        new_trip_id: String,
        new_seats: Vec<String>,
    },
}

/// Wire body for the `booking.route.created` and `booking.route.cancelled` kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SeatsMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_id: Option<Uuid>,
    pub trip_id: String,
    pub seat_numbers: Vec<String>,
}

/// Wire body for the `booking.route.changed` kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SeatsChangedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_id: Option<Uuid>,
    pub old_trip_id: String,
    pub old_seat_numbers: Vec<String>,
    pub new_trip_id: String,
    pub new_seat_numbers: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FactDecodeError {
    #[error("Unknown reservation fact kind: {0}")]
    UnknownKind(String),

    #[error("Malformed reservation payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ReservationFact {
    /// Facts for moving a booking from one seat set to another. A change that
    /// stays on one trip is a single `SeatsMoved`; a change across trips is a
    /// release keyed by the old trip and a reserve keyed by the new one, so
    /// each trip's partition sees every fact that touches it.
    pub fn for_seat_change(
        old_trip_id: &str,
        old_seats: &[String],
        new_trip_id: &str,
        new_seats: &[String],
    ) -> Vec<ReservationFact> {
        if old_trip_id == new_trip_id {
            return vec![ReservationFact::SeatsMoved {
                old_trip_id: old_trip_id.to_string(),
                old_seats: old_seats.to_vec(),
                new_trip_id: new_trip_id.to_string(),
                new_seats: new_seats.to_vec(),
            }];
        }
        vec![
            ReservationFact::SeatsReleased {
                trip_id: old_trip_id.to_string(),
                seats: old_seats.to_vec(),
            },
            ReservationFact::SeatsReserved {
                trip_id: new_trip_id.to_string(),
                seats: new_seats.to_vec(),
            },
        ]
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReservationFact::SeatsReserved { .. } => KIND_SEATS_RESERVED,
            ReservationFact::SeatsReleased { .. } => KIND_SEATS_RELEASED,
            ReservationFact::SeatsMoved { .. } => KIND_SEATS_MOVED,
        }
    }

    pub fn topic(&self) -> &'static str {
        TOPIC_RESERVATION_FACTS
    }

    /// Messages are keyed by trip so one trip's facts land on one partition.
    pub fn partition_key(&self) -> &str {
        match self {
            ReservationFact::SeatsReserved { trip_id, .. }
            | ReservationFact::SeatsReleased { trip_id, .. } => trip_id,
            ReservationFact::SeatsMoved { new_trip_id, .. } => new_trip_id,
        }
    }

    pub fn encode(&self, fact_id: Option<Uuid>) -> serde_json::Result<String> {
        match self {
            ReservationFact::SeatsReserved { trip_id, seats }
            | ReservationFact::SeatsReleased { trip_id, seats } => {
                serde_json::to_string(&SeatsMessage {
                    fact_id,
                    trip_id: trip_id.clone(),
                    seat_numbers: seats.clone(),
                })
            }
            ReservationFact::SeatsMoved {
                old_trip_id,
                old_seats,
                new_trip_id,
                new_seats,
            } => serde_json::to_string(&SeatsChangedMessage {
                fact_id,
                old_trip_id: old_trip_id.clone(),
                old_seat_numbers: old_seats.clone(),
                new_trip_id: new_trip_id.clone(),
                new_seat_numbers: new_seats.clone(),
            }),
        }
    }

    /// Decodes a message body; the kind header decides which fact it carries.
    pub fn decode(kind: &str, payload: &str) -> Result<(Option<Uuid>, Self), FactDecodeError> {
        match kind {
            KIND_SEATS_RESERVED => {
                let msg: SeatsMessage = serde_json::from_str(payload)?;
                Ok((
                    msg.fact_id,
                    ReservationFact::SeatsReserved {
                        trip_id: msg.trip_id,
                        seats: msg.seat_numbers,
                    },
                ))
            }
            KIND_SEATS_RELEASED => {
                let msg: SeatsMessage = serde_json::from_str(payload)?;
                Ok((
                    msg.fact_id,
                    ReservationFact::SeatsReleased {
                        trip_id: msg.trip_id,
                        seats: msg.seat_numbers,
                    },
                ))
            }
            KIND_SEATS_MOVED => {
                let msg: SeatsChangedMessage = serde_json::from_str(payload)?;
                Ok((
                    msg.fact_id,
                    ReservationFact::SeatsMoved {
                        old_trip_id: msg.old_trip_id,
                        old_seats: msg.old_seat_numbers,
                        new_trip_id: msg.new_trip_id,
                        new_seats: msg.new_seat_numbers,
                    },
                ))
            }
            other => Err(FactDecodeError::UnknownKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_message_uses_pascal_case_fields() {
        let fact = ReservationFact::SeatsReserved {
            trip_id: "T1".to_string(),
            seats: vec!["A1".to_string(), "A2".to_string()],
        };
        let payload = fact.encode(None).unwrap();
        assert_eq!(payload, r#"{"TripId":"T1","SeatNumbers":["A1","A2"]}"#);
    }

    #[test]
    fn test_decode_changed_message_with_fact_id() {
        let id = Uuid::new_v4();
        let payload = format!(
            r#"{{"FactId":"{}","OldTripId":"T1","OldSeatNumbers":["A1"],"NewTripId":"T2","NewSeatNumbers":["B4"]}}"#,
            id
        );
        let (fact_id, fact) = ReservationFact::decode(KIND_SEATS_MOVED, &payload).unwrap();
        assert_eq!(fact_id, Some(id));
        assert_eq!(fact.partition_key(), "T2");
        assert!(matches!(fact, ReservationFact::SeatsMoved { ref old_seats, .. } if old_seats == &vec!["A1".to_string()]));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let err = ReservationFact::decode("booking.route.unknown", "{}").unwrap_err();
        assert!(matches!(err, FactDecodeError::UnknownKind(_)));
    }

    #[test]
    fn test_every_fact_shares_one_topic() {
        let seats = vec!["A1".to_string()];
        let reserved = ReservationFact::SeatsReserved { trip_id: "T1".to_string(), seats: seats.clone() };
        let released = ReservationFact::SeatsReleased { trip_id: "T1".to_string(), seats: seats.clone() };
        let moved = ReservationFact::for_seat_change("T1", &seats, "T1", &["A2".to_string()]);

        assert_eq!(reserved.topic(), TOPIC_RESERVATION_FACTS);
        assert_eq!(released.topic(), TOPIC_RESERVATION_FACTS);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].topic(), TOPIC_RESERVATION_FACTS);
        assert_eq!(moved[0].kind(), KIND_SEATS_MOVED);
        assert_eq!(moved[0].partition_key(), "T1");
    }

    #[test]
    fn test_cross_trip_change_is_keyed_by_both_trips() {
        let facts = ReservationFact::for_seat_change("T1", &["A1".to_string()], "T2", &["B4".to_string()]);
        let keyed: Vec<(&str, &str)> = facts.iter().map(|f| (f.kind(), f.partition_key())).collect();
        assert_eq!(keyed, vec![(KIND_SEATS_RELEASED, "T1"), (KIND_SEATS_RESERVED, "T2")]);
    }
}
