// AI Model Engine
// Everything between a bus delivery and the outbound events

//! # AI Model Engine Module
//!
//! The engine sits between the domain models and the message bus.
//!
//! ## Components
//!
//! ### Intake (`subscriber`, `execution`, `delivery`)
//! - The subscriber decodes each delivery on its own thread and hands the
//!   work to the single execution context with a bounded wait
//! - The delivery pipeline turns the resulting disposition into an ack, a
//!   delayed redelivery, or a dead-letter envelope
//!
//! ### Dispatch (`dispatcher`, `workflows`)
//! - The dispatcher resolves the agent configuration and prompt, picks the
//!   workflow engine and publishes the outcome
//! - Five workflow engines: extractor, explorer, generator, conversational
//!   and tiered vision
//!
//! ### Outbound (`publisher`, `dead_letter`)
//! - Completed, failed and cost events
//! - Persistence and operator actions for dead-lettered messages
//!
//! ### Transport (`bus`, `nats_bus`)
//! - The bus traits plus an in-memory implementation
//! - NATS JetStream implementations used in production
//!
//! ### Jobs (`jobs`)
//! - Background execution with pollable and streamed progress

/// Bus abstractions and the in-memory bus
pub mod bus;

/// Interfaces to configuration caches, the LLM gateway, knowledge retrieval
/// and context tools, plus file-backed implementations
pub mod collaborators;

/// Dead-letter store, handler and operator actions
pub mod dead_letter;

/// Disposition to settlement mapping
pub mod delivery;

/// Configuration lookup, engine selection and outcome publishing
pub mod dispatcher;

/// The dedicated execution thread and its bounded handoff
pub mod execution;

/// Background jobs with progress tracking
pub mod jobs;

/// NATS JetStream bus, subscription loop and dead-letter store
pub mod nats_bus;

/// Outbound event publishing
pub mod publisher;

/// The synchronous bus callback
pub mod subscriber;

/// The five workflow engines
pub mod workflows;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;

pub use bus::{Disposition, InMemoryMessageBus, InboundMessage, MessageBus, MessageHandler};
pub use collaborators::{
    AgentConfigCache, ContextFetcher, FileCatalog, KnowledgeQuery, KnowledgeRetriever, Passage,
    PromptCache, StaticContextFetcher, StaticKnowledgeBase,
};
pub use dead_letter::{DeadLetterHandler, DeadLetterStore, InMemoryDeadLetterStore};
pub use delivery::{DeliveryPipeline, Settlement};
pub use dispatcher::{AgentExecutor, AgentServices, DispatchOutcome, DispatchStatus, Preflight};
pub use execution::ExecutionContext;
pub use jobs::{JobRegistry, JobTracker, ProgressReporter};
pub use nats_bus::{NatsDeadLetterStore, NatsMessageBus};
pub use publisher::Publisher;
pub use subscriber::Subscriber;
