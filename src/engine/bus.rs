//! Message bus abstraction
//!
//! The core only needs two things from a bus: publish bytes to a topic, and
//! hand delivered messages to a [`MessageHandler`] that answers with a
//! [`Disposition`]. [`InMemoryMessageBus`] records everything it is asked to
//! publish and is what tests and local runs use; the JetStream transport
//! lives in [`super::nats_bus`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::{AiModelError, Result};

/// A delivered message as seen by handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented by every redelivery
    pub delivery_attempt: u32,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            delivery_attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = attempt.max(1);
        self
    }
}

/// How a handler wants a delivery settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; acknowledge
    Success,
    /// Transient trouble; redeliver with backoff
    Retry,
    /// Can never succeed; route to the dead-letter topic
    Drop(String),
}

impl Disposition {
    pub fn is_drop(&self) -> bool {
        matches!(self, Disposition::Drop(_))
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> Disposition;
}

/// A message captured by [`InMemoryMessageBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

impl PublishedMessage {
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Bus that keeps every published message in memory.
pub struct InMemoryMessageBus {
    published: RwLock<Vec<PublishedMessage>>,
    sender: broadcast::Sender<PublishedMessage>,
    unavailable: AtomicBool,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            published: RwLock::new(Vec::new()),
            sender,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Live feed of publishes, e.g. for a local loop that re-delivers them.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.sender.subscribe()
    }

    /// Make every publish fail with a transport error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.read().await.clone()
    }

    pub async fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .read()
            .await
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AiModelError::Transport(format!(
                "in-memory bus unavailable, cannot publish to {}",
                topic
            )));
        }
        let message = PublishedMessage {
            topic: topic.to_string(),
            payload,
            published_at: Utc::now(),
        };
        debug!(topic, bytes = message.payload.len(), "published");
        self.published.write().await.push(message.clone());
        // no receivers is fine
        let _ = self.sender.send(message);
        Ok(())
    }
}
