//! Outbound events
//!
//! Topics:
//! - `ai.agent.{agent_id}.completed`
//! - `ai.agent.{agent_id}.failed`
//! - `ai.cost.recorded`
//!
//! The publisher does not retry. A transport error is logged and handed back
//! so the delivery can be retried as a whole.

use std::sync::Arc;
use tracing::{error, info};

use super::bus::MessageBus;
use crate::models::{AgentCompletedEvent, AgentFailedEvent, AgentResult, CostRecordedEvent};
use crate::{AiModelError, Result};

pub const COST_TOPIC: &str = "ai.cost.recorded";

pub fn completed_topic(agent_id: &str) -> String {
    format!("ai.agent.{}.completed", agent_id)
}

pub fn failed_topic(agent_id: &str) -> String {
    format!("ai.agent.{}.failed", agent_id)
}

/// Subject patterns covering every topic the publisher writes to.
pub fn outbound_subjects() -> Vec<String> {
    vec![completed_topic("*"), failed_topic("*"), COST_TOPIC.to_string()]
}

#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
}

impl Publisher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    pub async fn publish_completed(&self, event: &AgentCompletedEvent) -> Result<()> {
        event
            .result
            .validate()
            .map_err(|e| AiModelError::InvalidInput(format!("refusing to publish result: {}", e)))?;

        let topic = completed_topic(&event.agent_id);
        self.send(&topic, serde_json::to_vec(event)?).await?;
        info!(
            request_id = %event.request_id,
            agent_id = %event.agent_id,
            topic = %topic,
            execution_time_ms = event.execution_time_ms,
            "completed: {}",
            summarize(&event.result)
        );
        Ok(())
    }

    pub async fn publish_failed(&self, event: &AgentFailedEvent) -> Result<()> {
        let topic = failed_topic(&event.agent_id);
        self.send(&topic, serde_json::to_vec(event)?).await?;
        info!(
            request_id = %event.request_id,
            agent_id = %event.agent_id,
            topic = %topic,
            error_type = %event.error_type,
            "failed: {}",
            event.error_message
        );
        Ok(())
    }

    pub async fn publish_cost(&self, event: &CostRecordedEvent) -> Result<()> {
        self.send(COST_TOPIC, serde_json::to_vec(event)?).await
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.bus.publish(topic, payload).await.map_err(|e| {
            error!(topic, "publish failed: {}", e);
            e
        })
    }
}

/// One-line description of a result for logs.
fn summarize(result: &AgentResult) -> String {
    match result {
        AgentResult::Extractor(r) => format!(
            "extracted {} field(s), {} warning(s)",
            r.extracted_fields.len(),
            r.validation_warnings.len()
        ),
        AgentResult::Explorer(r) => format!(
            "diagnosis '{}' at {} ({:?}), {} source(s)",
            r.diagnosis,
            r.confidence,
            r.severity,
            r.rag_sources_used.len()
        ),
        AgentResult::Generator(r) => {
            format!("{} chars of {} in {}", r.content.chars().count(), r.format.as_str(), r.language)
        }
        AgentResult::Conversational(r) => format!(
            "turn {} of session {}, intent {}",
            r.turn_number, r.session_id, r.detected_intent
        ),
        AgentResult::TieredVision(r) => format!(
            "{} at {} via {:?} tier",
            r.classification, r.classification_confidence, r.tier_used
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::InMemoryMessageBus;
    use crate::models::{
        Confidence, EntityLinkage, ErrorType, TieredVisionResult, VisionTier,
    };
    use chrono::Utc;

    fn vision(tier: VisionTier, diagnosis: Option<&str>) -> AgentCompletedEvent {
        AgentCompletedEvent {
            request_id: "req-7".to_string(),
            agent_id: "leaf-screen".to_string(),
            linkage: EntityLinkage::for_farmer("WM-0001"),
            result: AgentResult::TieredVision(TieredVisionResult {
                classification: "healthy".to_string(),
                classification_confidence: Confidence::ONE,
                diagnosis: diagnosis.map(str::to_string),
                tier_used: tier,
                cost_saved: tier == VisionTier::Screen,
            }),
            execution_time_ms: 12,
            model_used: "claude-3-haiku-20240307".to_string(),
            cost_usd: Some(0.0001),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_completed_goes_to_agent_topic() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let publisher = Publisher::new(bus.clone());
        publisher.publish_completed(&vision(VisionTier::Screen, None)).await.unwrap();

        let published = bus.published_on("ai.agent.leaf-screen.completed").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].json().unwrap()["result"]["result_type"], "tiered_vision");
    }

    #[tokio::test]
    async fn test_invalid_result_is_not_published() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let publisher = Publisher::new(bus.clone());
        let err = publisher
            .publish_completed(&vision(VisionTier::Screen, Some("rust")))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(bus.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_is_returned() {
        let bus = Arc::new(InMemoryMessageBus::new());
        bus.set_unavailable(true);
        let publisher = Publisher::new(bus.clone());
        let failed = AgentFailedEvent {
            request_id: "req-8".to_string(),
            agent_id: "leaf-screen".to_string(),
            linkage: EntityLinkage::for_farmer("WM-0001"),
            error_type: ErrorType::LlmError,
            error_message: "boom".to_string(),
            retry_count: 2,
            failed_at: Utc::now(),
        };
        assert!(publisher.publish_failed(&failed).await.unwrap_err().is_transient());
    }
}
