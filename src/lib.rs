// AI Model - event-driven agent execution service
// Consumes agent requests from the bus, runs a workflow, publishes the outcome

//! # AI Model Library
//!
//! This is the library root for the AI Model service. A request arrives on the
//! bus, is handed from the delivery thread into a single execution context,
//! runs through one of five workflow engines, and leaves as exactly one
//! `completed` or `failed` event (plus best-effort cost telemetry).
//!
//! ## Control Flow
//!
//! ```text
//! bus ──▶ Subscriber (delivery thread)
//!           │  ExecutionContext::run_blocking (bounded wait)
//!           ▼
//!         AgentExecutor (execution context)
//!           │  selects by WorkflowSettings
//!           ▼
//!         Workflow engine ──▶ Publisher ──▶ bus
//! ```
//!
//! Every delivery ends in one of three dispositions:
//!
//! - **success**: processed, including business failures published as `failed`
//! - **retry**: transient trouble, the bus redelivers with backoff
//! - **drop**: the payload can never succeed and goes to the dead-letter topic
//!
//! The [`DeliveryPipeline`](engine::delivery::DeliveryPipeline) turns those
//! dispositions into acks, delayed naks, or dead-letter envelopes, and the
//! [`DeadLetterHandler`](engine::dead_letter::DeadLetterHandler) persists what
//! lands there for operator review.
//!
//! ## Modules
//!
//! - [`models`]: wire envelopes, result variants, configuration types
//! - [`engine`]: subscriber, dispatcher, workflows, publisher, dead-letter, bus
//! - [`llm`]: LLM gateway types and the Anthropic client
//! - [`config`]: layered service configuration

pub mod config;
pub mod engine;
pub mod llm;
pub mod models;

pub use config::{RetryPolicy, ServiceConfig};

pub use models::{
    AgentCompletedEvent, AgentConfig, AgentFailedEvent, AgentRequestEvent, AgentResult,
    AgentType, Confidence, CostRecordedEvent, DeadLetterRecord, DeadLetterStatus, EntityLinkage,
    ErrorType, PromptTemplate,
};

pub use engine::{
    bus::{Disposition, InMemoryMessageBus, InboundMessage, MessageBus},
    dead_letter::{DeadLetterHandler, DeadLetterStore, InMemoryDeadLetterStore},
    delivery::{DeliveryPipeline, Settlement},
    dispatcher::{AgentExecutor, AgentServices, DispatchOutcome},
    execution::ExecutionContext,
    publisher::Publisher,
    subscriber::Subscriber,
};

use thiserror::Error;

/// Errors raised by the service outside of workflow business logic.
///
/// Business failures (bad LLM output, validation exhaustion, analyzer
/// failures) never show up here; they are published as `failed` events.
/// What does show up is split by [`AiModelError::is_transient`] into
/// "try again later" and "this will never work".
#[derive(Error, Debug)]
pub enum AiModelError {
    /// A configuration, prompt, record or job that does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Publish or subscribe failure on the message bus
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persistence backends (dead-letter store, KV buckets)
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// A collaborator (config cache, retrieval, context tools) is unreachable
    #[error("Collaborator unavailable: {0}")]
    Collaborator(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("LLM error: {0}")]
    Llm(#[from] llm::LLMError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// An operator action on a dead-letter record that is no longer pending
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AiModelError {
    /// Whether redelivering the same message could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AiModelError::Transport(_)
            | AiModelError::Storage(_)
            | AiModelError::Collaborator(_)
            | AiModelError::Timeout(_) => true,
            AiModelError::Llm(err) => err.is_transient(),
            AiModelError::NotFound(_)
            | AiModelError::InvalidInput(_)
            | AiModelError::Serialization(_)
            | AiModelError::Config(_)
            | AiModelError::InvalidState(_)
            | AiModelError::Internal(_) => false,
        }
    }
}

impl From<std::io::Error> for AiModelError {
    fn from(err: std::io::Error) -> Self {
        AiModelError::Internal(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, AiModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AiModelError::Transport("nats down".into()).is_transient());
        assert!(AiModelError::Timeout("handoff".into()).is_transient());
        assert!(AiModelError::Llm(llm::LLMError::Network("reset".into())).is_transient());
        assert!(!AiModelError::Llm(llm::LLMError::InvalidRequest("bad".into())).is_transient());
        assert!(!AiModelError::NotFound("agent".into()).is_transient());
        assert!(!AiModelError::InvalidState("replayed".into()).is_transient());
    }
}
