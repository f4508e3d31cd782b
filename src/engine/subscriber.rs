//! The bus-facing entry point
//!
//! [`Subscriber::on_delivery`] is synchronous and runs on a delivery thread.
//! It decodes the payload there, hands the rest to the execution context
//! with a bounded wait, and reports a [`Disposition`]:
//!
//! - undecodable payloads, unknown agents and prompts without an active
//!   version are dropped
//! - handoff timeouts and transient collaborator or transport errors are
//!   retried
//! - everything else, including business failures published as `failed`,
//!   is a success

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::bus::{Disposition, InboundMessage, MessageHandler};
use super::dispatcher::{AgentExecutor, DispatchOutcome, Preflight};
use super::execution::ExecutionContext;
use crate::models::AgentRequestEvent;

enum Handled {
    Dispatched(DispatchOutcome),
    Rejected(String),
}

#[derive(Clone)]
pub struct Subscriber {
    executor: Arc<AgentExecutor>,
    context: Arc<ExecutionContext>,
    handoff_timeout: Duration,
}

impl Subscriber {
    pub fn new(executor: Arc<AgentExecutor>, context: Arc<ExecutionContext>, handoff_timeout: Duration) -> Self {
        Self {
            executor,
            context,
            handoff_timeout,
        }
    }

    /// Blocks the calling thread for at most the handoff timeout.
    pub fn on_delivery(&self, message: &InboundMessage) -> Disposition {
        let request = match AgentRequestEvent::decode(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(topic = %message.topic, attempt = message.delivery_attempt, "undecodable request: {}", e);
                return Disposition::Drop(format!("undecodable request: {}", e));
            }
        };
        let request_id = request.request_id.clone();
        let agent_id = request.agent_id.clone();

        let executor = self.executor.clone();
        let handed_off = self.context.run_blocking(
            async move {
                match executor.preflight(&request).await? {
                    Preflight::Ready { config, prompt } => executor
                        .dispatch_resolved(&request, config, prompt, None)
                        .await
                        .map(Handled::Dispatched),
                    Preflight::UnknownAgent => {
                        Ok(Handled::Rejected(format!("unknown agent_id: {}", request.agent_id)))
                    }
                    Preflight::MissingPrompt(prompt_id) => Ok(Handled::Rejected(format!(
                        "agent {} has no active prompt {}",
                        request.agent_id, prompt_id
                    ))),
                }
            },
            self.handoff_timeout,
        );

        match handed_off {
            Ok(Ok(Handled::Dispatched(outcome))) => {
                info!(
                    request_id = %request_id,
                    agent_id = %agent_id,
                    completed = outcome.is_completed(),
                    execution_time_ms = outcome.execution_time_ms,
                    "request handled"
                );
                Disposition::Success
            }
            Ok(Ok(Handled::Rejected(reason))) => {
                warn!(request_id = %request_id, "rejected: {}", reason);
                Disposition::Drop(reason)
            }
            Ok(Err(e)) if e.is_transient() => {
                warn!(request_id = %request_id, agent_id = %agent_id, "transient failure, will retry: {}", e);
                Disposition::Retry
            }
            Ok(Err(e)) => {
                error!(request_id = %request_id, agent_id = %agent_id, "permanent failure: {}", e);
                Disposition::Drop(e.to_string())
            }
            Err(e) => {
                warn!(request_id = %request_id, agent_id = %agent_id, "handoff failed, will retry: {}", e);
                Disposition::Retry
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Subscriber {
    async fn handle(&self, message: InboundMessage) -> Disposition {
        let subscriber = self.clone();
        tokio::task::spawn_blocking(move || subscriber.on_delivery(&message))
            .await
            .unwrap_or_else(|e| {
                error!("delivery thread panicked: {}", e);
                Disposition::Retry
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::InMemoryMessageBus;
    use crate::engine::collaborators::FileCatalog;
    use crate::engine::publisher::Publisher;
    use crate::engine::testing::{services, test_prompt, Reply, ScriptedLlm, UnreachableCache};
    use crate::engine::dispatcher::AgentServices;
    use crate::models::{AgentConfig, EntityLinkage, GeneratorSettings, WorkflowSettings};
    use serde_json::json;

    fn subscriber_with(services: AgentServices) -> (Subscriber, Arc<InMemoryMessageBus>) {
        let bus = Arc::new(InMemoryMessageBus::new());
        let executor = Arc::new(AgentExecutor::new(services, Publisher::new(bus.clone()), Duration::from_secs(5)));
        let context = Arc::new(ExecutionContext::start("subscriber-test").unwrap());
        (Subscriber::new(executor, context, Duration::from_secs(2)), bus)
    }

    fn catalog() -> FileCatalog {
        FileCatalog::from_parts(
            vec![AgentConfig::new(
                "advice-writer",
                "advice",
                WorkflowSettings::Generator(GeneratorSettings::default()),
            )],
            vec![test_prompt("advice")],
        )
    }

    fn payload(agent_id: &str) -> Vec<u8> {
        serde_json::to_vec(&AgentRequestEvent::new(
            "req-1",
            agent_id,
            EntityLinkage::for_farmer("WM-0001"),
            json!({"topic": "pruning"}),
        ))
        .unwrap()
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let (subscriber, _) = subscriber_with(services(catalog(), Arc::new(ScriptedLlm::new())));
        let disposition = subscriber.on_delivery(&InboundMessage::new("ai.agent.requested", b"{not json".to_vec()));
        assert!(disposition.is_drop());
    }

    #[test]
    fn test_missing_linkage_is_dropped() {
        let (subscriber, _) = subscriber_with(services(catalog(), Arc::new(ScriptedLlm::new())));
        let body = json!({"request_id": "r", "agent_id": "advice-writer", "linkage": {}, "input_data": {}});
        let disposition = subscriber.on_delivery(&InboundMessage::new("ai.agent.requested", body.to_string()));
        assert!(disposition.is_drop());
    }

    #[test]
    fn test_unknown_agent_is_dropped() {
        let (subscriber, _) = subscriber_with(services(catalog(), Arc::new(ScriptedLlm::new())));
        let disposition = subscriber.on_delivery(&InboundMessage::new("ai.agent.requested", payload("ghost")));
        assert_eq!(disposition, Disposition::Drop("unknown agent_id: ghost".to_string()));
    }

    #[test]
    fn test_unreachable_cache_is_retried() {
        let cache = Arc::new(UnreachableCache);
        let mut services = services(catalog(), Arc::new(ScriptedLlm::new()));
        services.config_cache = cache;
        let (subscriber, _) = subscriber_with(services);
        let disposition = subscriber.on_delivery(&InboundMessage::new("ai.agent.requested", payload("advice-writer")));
        assert_eq!(disposition, Disposition::Retry);
    }

    #[test]
    fn test_business_failure_is_success() {
        let llm = ScriptedLlm::new().when("Task: generate", Reply::text("   "));
        let (subscriber, bus) = subscriber_with(services(catalog(), Arc::new(llm)));
        let disposition = subscriber.on_delivery(&InboundMessage::new("ai.agent.requested", payload("advice-writer")));
        assert_eq!(disposition, Disposition::Success);

        let failed = tokio_test::block_on(bus.published_on("ai.agent.advice-writer.failed"));
        assert_eq!(failed.len(), 1);
        assert!(tokio_test::block_on(bus.published_on("ai.agent.advice-writer.completed")).is_empty());
    }
}
