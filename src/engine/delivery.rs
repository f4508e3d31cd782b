//! Turning dispositions into bus settlements.
//!
//! | Disposition | Attempts left | Settlement |
//! |---|---|---|
//! | success | any | ack |
//! | retry | yes | nak with backoff |
//! | retry | no | dead-letter (retries exhausted) |
//! | drop | any | dead-letter (dropped) |
//!
//! Dead-lettering publishes a [`DeadLetterEnvelope`] and then acks the
//! original. If that publish fails the original is nak'd instead so it
//! comes back rather than vanishing.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::bus::{Disposition, InboundMessage, MessageBus, MessageHandler};
use crate::config::RetryPolicy;
use crate::models::{DeadLetterEnvelope, DeadLetterReason};

#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Ack,
    /// Redeliver after the delay
    Nak(Duration),
    /// Envelope published to the dead-letter topic; ack the original
    DeadLettered(DeadLetterReason),
}

pub struct DeliveryPipeline {
    bus: Arc<dyn MessageBus>,
    retry: RetryPolicy,
    dead_letter_topic: Option<String>,
}

impl DeliveryPipeline {
    pub fn new(bus: Arc<dyn MessageBus>, retry: RetryPolicy, dead_letter_topic: impl Into<String>) -> Self {
        Self {
            bus,
            retry,
            dead_letter_topic: Some(dead_letter_topic.into()),
        }
    }

    /// Pipeline for the dead-letter topic's own consumer: retries never
    /// exhaust and nothing is forwarded anywhere else.
    pub fn terminal(bus: Arc<dyn MessageBus>, retry: RetryPolicy) -> Self {
        Self {
            bus,
            retry,
            dead_letter_topic: None,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn process(&self, handler: &dyn MessageHandler, message: InboundMessage) -> Settlement {
        let disposition = handler.handle(message.clone()).await;
        self.settle(&message, disposition).await
    }

    pub async fn settle(&self, message: &InboundMessage, disposition: Disposition) -> Settlement {
        let attempt = message.delivery_attempt;
        let Some(dead_letter_topic) = self.dead_letter_topic.as_deref() else {
            return match disposition {
                Disposition::Success => Settlement::Ack,
                Disposition::Retry => Settlement::Nak(self.retry.delay_for(attempt)),
                Disposition::Drop(detail) => {
                    error!(topic = %message.topic, "message dropped with no dead-letter route: {}", detail);
                    Settlement::Ack
                }
            };
        };

        let reason = match disposition {
            Disposition::Success => return Settlement::Ack,
            Disposition::Retry if !self.retry.is_exhausted(attempt) => {
                let delay = self.retry.delay_for(attempt);
                debug!(topic = %message.topic, attempt, ?delay, "scheduling redelivery");
                return Settlement::Nak(delay);
            }
            Disposition::Retry => DeadLetterReason::RetriesExhausted { attempts: attempt },
            Disposition::Drop(detail) => DeadLetterReason::Dropped { detail },
        };

        let envelope = DeadLetterEnvelope {
            original_topic: message.topic.clone(),
            payload: message.payload.clone(),
            reason: reason.clone(),
            delivery_attempts: attempt,
            dead_lettered_at: Utc::now(),
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode dead-letter envelope: {}", e);
                return Settlement::Nak(self.retry.delay_for(attempt));
            }
        };

        match self.bus.publish(dead_letter_topic, payload).await {
            Ok(()) => {
                warn!(topic = %message.topic, attempt, "dead-lettered: {}", reason);
                Settlement::DeadLettered(reason)
            }
            Err(e) => {
                error!(topic = %message.topic, "dead-letter publish failed, will redeliver: {}", e);
                Settlement::Nak(self.retry.delay_for(attempt))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::InMemoryMessageBus;

    fn pipeline() -> (DeliveryPipeline, Arc<InMemoryMessageBus>) {
        let bus = Arc::new(InMemoryMessageBus::new());
        (
            DeliveryPipeline::new(bus.clone(), RetryPolicy::default(), "events.dlq"),
            bus,
        )
    }

    #[tokio::test]
    async fn test_retry_backs_off_then_dead_letters() {
        let (pipeline, bus) = pipeline();
        let message = InboundMessage::new("ai.agent.requested", b"{}".to_vec());

        assert_eq!(
            pipeline.settle(&message, Disposition::Retry).await,
            Settlement::Nak(Duration::from_secs(1))
        );
        assert_eq!(
            pipeline.settle(&message.clone().with_attempt(2), Disposition::Retry).await,
            Settlement::Nak(Duration::from_secs(2))
        );
        assert_eq!(
            pipeline.settle(&message.clone().with_attempt(3), Disposition::Retry).await,
            Settlement::DeadLettered(DeadLetterReason::RetriesExhausted { attempts: 3 })
        );

        let dlq = bus.published_on("events.dlq").await;
        assert_eq!(dlq.len(), 1);
        let envelope: DeadLetterEnvelope = serde_json::from_slice(&dlq[0].payload).unwrap();
        assert_eq!(envelope.payload, b"{}".to_vec());
        assert_eq!(envelope.delivery_attempts, 3);
    }

    #[tokio::test]
    async fn test_drop_dead_letters_immediately() {
        let (pipeline, bus) = pipeline();
        let message = InboundMessage::new("ai.agent.requested", b"garbage".to_vec());
        let settlement = pipeline
            .settle(&message, Disposition::Drop("not json".to_string()))
            .await;
        assert!(matches!(settlement, Settlement::DeadLettered(DeadLetterReason::Dropped { .. })));
        assert_eq!(bus.published_on("events.dlq").await.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_publish_failure_naks() {
        let (pipeline, bus) = pipeline();
        bus.set_unavailable(true);
        let message = InboundMessage::new("ai.agent.requested", b"garbage".to_vec());
        assert_eq!(
            pipeline.settle(&message, Disposition::Drop("bad".to_string())).await,
            Settlement::Nak(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn test_terminal_pipeline_never_exhausts() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let pipeline = DeliveryPipeline::terminal(bus.clone(), RetryPolicy::default());
        let message = InboundMessage::new("events.dlq", b"x".to_vec()).with_attempt(50);
        assert_eq!(
            pipeline.settle(&message, Disposition::Retry).await,
            Settlement::Nak(Duration::from_secs(30))
        );
        assert!(bus.published().await.is_empty());
    }
}
