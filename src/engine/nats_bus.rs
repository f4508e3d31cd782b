// NATS JetStream transport
// Request intake, outbound events and dead-letter persistence over one connection

//! # NATS Transport
//!
//! Production wiring for the bus abstractions:
//!
//! - [`NatsMessageBus`] publishes through JetStream and waits for the
//!   server's ack, so a returned `Ok` means the event is persisted
//! - [`run_subscription`] drives a durable pull consumer with explicit acks
//!   and settles each delivery through a
//!   [`DeliveryPipeline`](super::delivery::DeliveryPipeline)
//! - [`NatsDeadLetterStore`] keeps dead-letter records in a JetStream
//!   key-value bucket
//!
//! Every subject the service touches lives in one stream: the request and
//! dead-letter topics it consumes and the outbound `ai.agent.*.completed`,
//! `ai.agent.*.failed` and `ai.cost.recorded` topics it publishes. A
//! JetStream publish to a subject no stream binds is rejected, so the
//! outbound patterns must be bound here.

use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bus::{InboundMessage, MessageBus, MessageHandler};
use super::dead_letter::DeadLetterStore;
use super::delivery::{DeliveryPipeline, Settlement};
use super::publisher::outbound_subjects;
use crate::config::NatsConfig;
use crate::models::{DeadLetterRecord, DeadLetterStatus};
use crate::{AiModelError, Result};

/// Connect with a linear backoff between attempts.
pub async fn connect_with_retry(config: &NatsConfig) -> Result<Client> {
    let attempts = config.reconnect_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let options = async_nats::ConnectOptions::new()
            .name(&config.client_name)
            .connection_timeout(config.connection_timeout())
            .request_timeout(Some(config.connection_timeout() * attempts as u32));

        match options.connect(&config.url).await {
            Ok(client) => {
                info!("Connected to NATS at {} after {} attempt(s)", config.url, attempt);
                return Ok(client);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    warn!("NATS connection attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
            }
        }
    }

    error!("Failed to connect to NATS after {} attempts: {}", attempts, last_error);
    Err(AiModelError::Transport(format!(
        "cannot connect to NATS at {}: {}",
        config.url, last_error
    )))
}

/// Whether NATS subject `pattern` matches every subject `subject` can.
/// Only the single-token `*` and trailing `>` wildcards are recognised.
fn subject_covers(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(token)) => {
                if token == ">" {
                    return false;
                }
            }
            (Some(p), Some(t)) => {
                if p != t {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Intake topics plus the outbound patterns, without subjects an earlier
/// entry already covers. JetStream rejects overlapping subjects in one stream.
pub fn stream_subjects(intake: &[String]) -> Vec<String> {
    let mut subjects: Vec<String> = Vec::new();
    for subject in intake.iter().cloned().chain(outbound_subjects()) {
        if subjects.iter().any(|existing| subject_covers(existing, &subject)) {
            continue;
        }
        subjects.retain(|existing| !subject_covers(&subject, existing));
        subjects.push(subject);
    }
    subjects
}

/// Create the service stream if missing, or widen an existing one that was
/// created without some of the subjects. `intake` are the request and
/// dead-letter topics.
pub async fn ensure_stream(js: &jetstream::Context, config: &NatsConfig, intake: &[String]) -> Result<stream::Stream> {
    let subjects = stream_subjects(intake);
    let stream_config = stream::Config {
        name: config.stream_name.clone(),
        subjects: subjects.clone(),
        storage: stream::StorageType::File,
        retention: stream::RetentionPolicy::Limits,
        discard: stream::DiscardPolicy::Old,
        max_age: Duration::from_secs(7 * 24 * 60 * 60),
        duplicate_window: Duration::from_secs(120),
        num_replicas: 1,
        ..Default::default()
    };
    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| AiModelError::Transport(format!("cannot create stream {}: {}", config.stream_name, e)))?;

    let existing = &stream.cached_info().config;
    let missing: Vec<&String> = subjects
        .iter()
        .filter(|subject| !existing.subjects.iter().any(|bound| subject_covers(bound, subject)))
        .collect();
    if missing.is_empty() {
        debug!(stream = %config.stream_name, "stream subjects up to date");
        return Ok(stream);
    }

    info!("🔧 Adding subjects {:?} to stream {}", missing, config.stream_name);
    let mut widened = existing.clone();
    widened.subjects = stream_subjects(&[existing.subjects.clone(), subjects].concat());
    js.update_stream(&widened)
        .await
        .map_err(|e| AiModelError::Transport(format!("cannot update stream {}: {}", config.stream_name, e)))?;
    js.get_stream(&config.stream_name)
        .await
        .map_err(|e| AiModelError::Transport(format!("cannot open stream {}: {}", config.stream_name, e)))
}

/// Open a KV bucket, creating it on first use.
pub async fn ensure_kv_bucket(js: &jetstream::Context, bucket: &str) -> Result<jetstream::kv::Store> {
    match js.get_key_value(bucket).await {
        Ok(kv) => {
            debug!("Using existing KV bucket: {}", bucket);
            Ok(kv)
        }
        Err(_) => {
            info!("Creating KV bucket: {}", bucket);
            let kv_config = jetstream::kv::Config {
                bucket: bucket.to_string(),
                history: 5,
                storage: stream::StorageType::File,
                num_replicas: 1,
                description: format!("AI Model dead letters - {}", bucket),
                ..Default::default()
            };
            js.create_key_value(kv_config).await.map_err(|e| {
                error!("Failed to create KV bucket {}: {}", bucket, e);
                AiModelError::Storage(anyhow::anyhow!("failed to create KV bucket {}: {}", bucket, e))
            })
        }
    }
}

/// Durable pull consumer with explicit acks and no server-side delivery
/// cap; the pipeline decides when to give up.
pub async fn durable_consumer(
    stream: &stream::Stream,
    name: &str,
    subject: &str,
    ack_wait: Duration,
) -> Result<consumer::PullConsumer> {
    let consumer_config = consumer::pull::Config {
        durable_name: Some(name.to_string()),
        filter_subject: subject.to_string(),
        ack_policy: consumer::AckPolicy::Explicit,
        deliver_policy: consumer::DeliverPolicy::All,
        ack_wait,
        max_deliver: -1,
        ..Default::default()
    };
    stream
        .get_or_create_consumer(name, consumer_config)
        .await
        .map_err(|e| AiModelError::Transport(format!("cannot create consumer {}: {}", name, e)))
}

pub struct NatsMessageBus {
    js: jetstream::Context,
}

impl NatsMessageBus {
    pub fn new(js: jetstream::Context) -> Self {
        Self { js }
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let ack = self
            .js
            .publish(topic.to_string(), Bytes::from(payload))
            .await
            .map_err(|e| AiModelError::Transport(format!("publish to {} failed: {}", topic, e)))?;
        let ack = ack
            .await
            .map_err(|e| AiModelError::Transport(format!("no ack for {}: {}", topic, e)))?;
        debug!(topic, stream = %ack.stream, sequence = ack.sequence, "published");
        Ok(())
    }
}

/// Pull deliveries until `cancel` fires, handling up to `max_in_flight` at once.
pub async fn run_subscription(
    consumer: consumer::PullConsumer,
    handler: &dyn MessageHandler,
    pipeline: &DeliveryPipeline,
    cancel: CancellationToken,
    max_in_flight: usize,
) -> Result<()> {
    let messages = consumer
        .messages()
        .await
        .map_err(|e| AiModelError::Transport(format!("cannot pull messages: {}", e)))?;

    messages
        .take_until(cancel.cancelled())
        .for_each_concurrent(max_in_flight.max(1), |delivery| async move {
            let message = match delivery {
                Ok(message) => message,
                Err(e) => {
                    warn!("pull error: {}", e);
                    return;
                }
            };
            let attempt = message.info().map(|info| info.delivered.max(1) as u32).unwrap_or(1);
            let inbound = InboundMessage::new(message.subject.to_string(), message.payload.to_vec()).with_attempt(attempt);

            let settled = match pipeline.process(handler, inbound).await {
                Settlement::Ack | Settlement::DeadLettered(_) => message.ack().await,
                Settlement::Nak(delay) => message.ack_with(AckKind::Nak(Some(delay))).await,
            };
            if let Err(e) = settled {
                // the server redelivers after ack_wait
                warn!(subject = %message.subject, "failed to settle delivery: {}", e);
            }
        })
        .await;

    info!("subscription stopped");
    Ok(())
}

/// Dead-letter records in a JetStream KV bucket, keyed by record id.
pub struct NatsDeadLetterStore {
    kv: jetstream::kv::Store,
}

impl NatsDeadLetterStore {
    pub fn new(kv: jetstream::kv::Store) -> Self {
        Self { kv }
    }

    async fn put(&self, record: &DeadLetterRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.kv
            .put(record.id.to_string(), Bytes::from(bytes))
            .await
            .map_err(|e| AiModelError::Storage(anyhow::anyhow!("failed to store dead letter {}: {}", record.id, e)))?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<DeadLetterRecord>> {
        let mut keys = self
            .kv
            .keys()
            .await
            .map_err(|e| AiModelError::Storage(anyhow::anyhow!("failed to list dead letters: {}", e)))?;

        let mut records = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| AiModelError::Storage(anyhow::anyhow!("failed to read key: {}", e)))?;
            let Ok(id) = Uuid::parse_str(&key) else {
                debug!(key = %key, "skipping foreign key in dead-letter bucket");
                continue;
            };
            if let Some(record) = self.get(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DeadLetterStore for NatsDeadLetterStore {
    async fn save(&self, record: &DeadLetterRecord) -> Result<()> {
        self.put(record).await
    }

    async fn get(&self, id: &Uuid) -> Result<Option<DeadLetterRecord>> {
        let entry = self
            .kv
            .get(id.to_string())
            .await
            .map_err(|e| AiModelError::Storage(anyhow::anyhow!("failed to read dead letter {}: {}", id, e)))?;
        match entry {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, record: &DeadLetterRecord) -> Result<()> {
        self.put(record).await
    }

    async fn list(&self, status: Option<DeadLetterStatus>, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let mut records: Vec<DeadLetterRecord> = self
            .all()
            .await?
            .into_iter()
            .filter(|record| status.map_or(true, |status| record.status == status))
            .collect();
        records.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn count_by_status(&self) -> Result<HashMap<DeadLetterStatus, usize>> {
        let mut counts = HashMap::new();
        for record in self.all().await? {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards_cover_concrete_subjects() {
        assert!(subject_covers("ai.agent.*.completed", "ai.agent.qc-event-extractor.completed"));
        assert!(subject_covers("ai.>", "ai.cost.recorded"));
        assert!(!subject_covers("ai.agent.*.completed", "ai.agent.requested"));
        assert!(!subject_covers("ai.agent.*.completed", "ai.agent.x.failed"));
        assert!(!subject_covers("ai.agent.requested", "ai.agent.*.completed"));
    }

    #[test]
    fn test_stream_binds_every_published_subject() {
        let subjects = stream_subjects(&["ai.agent.requested".to_string(), "events.dlq".to_string()]);
        assert_eq!(
            subjects,
            vec![
                "ai.agent.requested",
                "events.dlq",
                "ai.agent.*.completed",
                "ai.agent.*.failed",
                "ai.cost.recorded",
            ]
        );

        for topic in [
            crate::engine::publisher::completed_topic("qc-event-extractor"),
            crate::engine::publisher::failed_topic("qc-event-extractor"),
            crate::engine::publisher::COST_TOPIC.to_string(),
        ] {
            assert!(subjects.iter().any(|bound| subject_covers(bound, &topic)), "{} is unbound", topic);
        }
    }

    #[test]
    fn test_overlapping_intake_subjects_collapse() {
        let subjects = stream_subjects(&["ai.>".to_string(), "events.dlq".to_string()]);
        assert_eq!(subjects, vec!["ai.>", "events.dlq"]);

        let subjects = stream_subjects(&["ai.cost.recorded".to_string()]);
        assert_eq!(subjects, vec!["ai.cost.recorded", "ai.agent.*.completed", "ai.agent.*.failed"]);
    }
}
