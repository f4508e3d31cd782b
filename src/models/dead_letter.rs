//! Dead-letter records kept for operator review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    PendingReview,
    Replayed,
    Discarded,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::PendingReview => "pending_review",
            DeadLetterStatus::Replayed => "replayed",
            DeadLetterStatus::Discarded => "discarded",
        }
    }
}

impl std::str::FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_review" | "pending" => Ok(DeadLetterStatus::PendingReview),
            "replayed" => Ok(DeadLetterStatus::Replayed),
            "discarded" => Ok(DeadLetterStatus::Discarded),
            other => Err(format!("unknown dead-letter status: {}", other)),
        }
    }
}

/// Why a message reached the dead-letter topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The subscriber dispositioned the message as drop
    Dropped { detail: String },
    /// The bus gave up after its redelivery budget
    RetriesExhausted { attempts: u32 },
    /// Something arrived on the dead-letter topic without our envelope
    Unrecognized,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::Dropped { detail } => write!(f, "dropped: {}", detail),
            DeadLetterReason::RetriesExhausted { attempts } => {
                write!(f, "retries exhausted after {} attempts", attempts)
            }
            DeadLetterReason::Unrecognized => write!(f, "unrecognized dead-letter payload"),
        }
    }
}

/// What the delivery pipeline publishes on the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub original_topic: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub reason: DeadLetterReason,
    pub delivery_attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Persisted dead-letter entry. Only operator actions change its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub original_topic: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub reason: DeadLetterReason,
    pub delivery_attempts: u32,
    pub received_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discarded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_reason: Option<String>,
}

impl DeadLetterRecord {
    pub fn from_envelope(envelope: DeadLetterEnvelope) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_topic: envelope.original_topic,
            payload: envelope.payload,
            reason: envelope.reason,
            delivery_attempts: envelope.delivery_attempts,
            received_at: Utc::now(),
            status: DeadLetterStatus::PendingReview,
            replayed_at: None,
            discarded_at: None,
            discard_reason: None,
        }
    }

    /// Wrap a raw message that arrived without a dead-letter envelope.
    pub fn unrecognized(topic: &str, payload: Vec<u8>, delivery_attempts: u32) -> Self {
        Self::from_envelope(DeadLetterEnvelope {
            original_topic: topic.to_string(),
            payload,
            reason: DeadLetterReason::Unrecognized,
            delivery_attempts,
            dead_lettered_at: Utc::now(),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == DeadLetterStatus::PendingReview
    }

    pub fn mark_replayed(&mut self) {
        self.status = DeadLetterStatus::Replayed;
        self.replayed_at = Some(Utc::now());
    }

    pub fn mark_discarded(&mut self, reason: impl Into<String>) {
        self.status = DeadLetterStatus::Discarded;
        self.discarded_at = Some(Utc::now());
        self.discard_reason = Some(reason.into());
    }

    /// Payload as text for display; invalid UTF-8 is replaced.
    pub fn payload_preview(&self, max_chars: usize) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        if text.chars().count() > max_chars {
            let truncated: String = text.chars().take(max_chars).collect();
            format!("{}…", truncated)
        } else {
            text.into_owned()
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_survives_serialization_byte_for_byte() {
        let payload = vec![0xff, 0x00, b'{', b'}', 0x80];
        let record = DeadLetterRecord::unrecognized("events.dlq", payload.clone(), 1);
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: DeadLetterRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.status, DeadLetterStatus::PendingReview);
    }

    #[test]
    fn test_status_transitions_set_timestamps() {
        let mut record = DeadLetterRecord::unrecognized("ai.agent.requested", b"{}".to_vec(), 3);
        record.mark_discarded("duplicate of req-9");
        assert_eq!(record.status, DeadLetterStatus::Discarded);
        assert!(record.discarded_at.is_some());
        assert_eq!(record.discard_reason.as_deref(), Some("duplicate of req-9"));
        assert!(!record.is_pending());
    }

    #[test]
    fn test_preview_truncates() {
        let record = DeadLetterRecord::unrecognized("t", b"abcdefgh".to_vec(), 1);
        assert_eq!(record.payload_preview(3), "abc…");
        assert_eq!(record.payload_preview(20), "abcdefgh");
        assert_eq!("pending".parse::<DeadLetterStatus>(), Ok(DeadLetterStatus::PendingReview));
    }
}
