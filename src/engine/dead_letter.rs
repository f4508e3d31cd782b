// Dead-letter handling
// Persists everything that lands on the dead-letter topic and exposes the
// operator actions (replay, discard) the admin CLI drives.

//! # Dead-Letter Handler
//!
//! Messages reach the dead-letter topic either because the subscriber
//! dispositioned them as drop, or because their redelivery budget ran out.
//! Either way they arrive wrapped in a
//! [`DeadLetterEnvelope`](crate::models::DeadLetterEnvelope) and are stored
//! as a [`DeadLetterRecord`] in `pending_review`.
//!
//! Nothing is replayed automatically. An operator either replays a record
//! (its original payload is republished, byte for byte, to its original
//! topic) or discards it with a reason. Both are only legal from
//! `pending_review`.
//!
//! If the store cannot be written, the handler answers
//! [`Disposition::Retry`] so the dead-letter message itself is redelivered
//! and nothing is lost.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::bus::{Disposition, InboundMessage, MessageBus, MessageHandler};
use crate::models::{DeadLetterEnvelope, DeadLetterRecord, DeadLetterStatus};
use crate::{AiModelError, Result};

/// Persistence for dead-letter records.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn save(&self, record: &DeadLetterRecord) -> Result<()>;

    async fn get(&self, id: &Uuid) -> Result<Option<DeadLetterRecord>>;

    /// Overwrite an existing record after a status change
    async fn update(&self, record: &DeadLetterRecord) -> Result<()>;

    /// Newest first, optionally filtered by status
    async fn list(&self, status: Option<DeadLetterStatus>, limit: usize) -> Result<Vec<DeadLetterRecord>>;

    async fn count_by_status(&self) -> Result<HashMap<DeadLetterStatus, usize>>;
}

/// In-memory store for tests and local runs.
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<HashMap<Uuid, DeadLetterRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(AiModelError::Storage(anyhow::anyhow!("dead-letter store unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn save(&self, record: &DeadLetterRecord) -> Result<()> {
        self.check_available()?;
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<DeadLetterRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update(&self, record: &DeadLetterRecord) -> Result<()> {
        self.check_available()?;
        let mut records = self.records.write().await;
        if !records.contains_key(&record.id) {
            return Err(AiModelError::NotFound(format!("dead-letter record {}", record.id)));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn list(&self, status: Option<DeadLetterStatus>, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<DeadLetterRecord> = records
            .values()
            .filter(|record| status.map_or(true, |s| record.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn count_by_status(&self) -> Result<HashMap<DeadLetterStatus, usize>> {
        let mut counts = HashMap::new();
        for record in self.records.read().await.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

pub struct DeadLetterHandler {
    store: Arc<dyn DeadLetterStore>,
    bus: Arc<dyn MessageBus>,
}

impl DeadLetterHandler {
    pub fn new(store: Arc<dyn DeadLetterStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }

    /// Persist one dead-letter delivery.
    pub async fn on_dead_letter(&self, message: &InboundMessage) -> Disposition {
        let record = match serde_json::from_slice::<DeadLetterEnvelope>(&message.payload) {
            Ok(envelope) => DeadLetterRecord::from_envelope(envelope),
            Err(e) => {
                warn!(topic = %message.topic, "dead-letter payload without envelope: {}", e);
                DeadLetterRecord::unrecognized(&message.topic, message.payload.clone(), message.delivery_attempt)
            }
        };

        match self.store.save(&record).await {
            Ok(()) => {
                info!(
                    dead_letter_id = %record.id,
                    original_topic = %record.original_topic,
                    attempts = record.delivery_attempts,
                    "dead letter stored: {}",
                    record.reason
                );
                Disposition::Success
            }
            Err(e) => {
                error!(original_topic = %record.original_topic, "failed to store dead letter: {}", e);
                Disposition::Retry
            }
        }
    }

    /// Republish the original payload to its original topic.
    ///
    /// The `replayed` status is stored before publishing, so a store failure
    /// leaves nothing on the bus. A failed publish puts the record back to
    /// pending review.
    pub async fn replay(&self, id: &Uuid) -> Result<DeadLetterRecord> {
        let pending = self.pending(id).await?;
        let mut record = pending.clone();
        record.mark_replayed();
        self.store.update(&record).await?;

        if let Err(e) = self.bus.publish(&record.original_topic, record.payload.clone()).await {
            warn!(dead_letter_id = %id, "replay publish failed, restoring pending review: {}", e);
            if let Err(restore) = self.store.update(&pending).await {
                error!(dead_letter_id = %id, "record left as replayed without a publish: {}", restore);
            }
            return Err(e);
        }
        info!(dead_letter_id = %id, topic = %record.original_topic, "dead letter replayed");
        Ok(record)
    }

    pub async fn discard(&self, id: &Uuid, reason: &str) -> Result<DeadLetterRecord> {
        let mut record = self.pending(id).await?;
        record.mark_discarded(reason);
        self.store.update(&record).await?;
        info!(dead_letter_id = %id, reason, "dead letter discarded");
        Ok(record)
    }

    pub async fn get(&self, id: &Uuid) -> Result<Option<DeadLetterRecord>> {
        self.store.get(id).await
    }

    pub async fn list(&self, status: Option<DeadLetterStatus>, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        self.store.list(status, limit).await
    }

    pub async fn stats(&self) -> Result<HashMap<DeadLetterStatus, usize>> {
        self.store.count_by_status().await
    }

    async fn pending(&self, id: &Uuid) -> Result<DeadLetterRecord> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| AiModelError::NotFound(format!("dead-letter record {}", id)))?;
        if !record.is_pending() {
            return Err(AiModelError::InvalidState(format!(
                "dead-letter record {} is already {}",
                id,
                record.status.as_str()
            )));
        }
        Ok(record)
    }
}

#[async_trait]
impl MessageHandler for DeadLetterHandler {
    async fn handle(&self, message: InboundMessage) -> Disposition {
        self.on_dead_letter(&message).await
    }
}
