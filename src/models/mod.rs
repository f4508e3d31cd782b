// Domain models for the AI Model agent service
// Wire envelopes, result variants, agent configuration and dead-letter records

//! # Domain Models Module
//!
//! Plain data types shared by the engine, the binaries and anything that
//! talks to the service over the bus. Nothing in here performs I/O.
//!
//! - [`linkage`]: the entity identifiers every request and result carries
//! - [`events`]: inbound request and outbound completed/failed/cost envelopes
//! - [`result`]: the five workflow result shapes as one tagged union
//! - [`agent`]: agent configuration and prompt templates served by the caches
//! - [`dead_letter`]: what the dead-letter handler persists
//! - [`job`]: progress of long-running extraction jobs

pub mod agent;
pub mod dead_letter;
pub mod events;
pub mod job;
pub mod linkage;
pub mod result;

/// Entity linkage attached to requests, results and failures
pub use linkage::{EntityLinkage, LinkageError};

/// Bus envelopes
pub use events::{
    AgentCompletedEvent, AgentFailedEvent, AgentRequestEvent, CostRecordedEvent, EnvelopeError,
    ErrorType,
};

/// Workflow results
pub use result::{
    AgentResult, Confidence, ConfidenceOutOfRange, ConversationalResult, ExplorerResult,
    ExtractorResult, GeneratorResult, OutputFormat, ResultInvariantError, Severity,
    TieredVisionResult, VisionTier,
};

/// Agent configuration and prompts
pub use agent::{
    AgentConfig, AgentType, AnalyzerSpec, ConversationalSettings, ExplorerSettings,
    ExtractorSettings, FieldSchema, FieldType, GeneratorSettings, LLMConfig, Normalization,
    PromptStatus, PromptTemplate, RagConfig, TieredVisionSettings, WorkflowSettings,
};

/// Dead-letter records
pub use dead_letter::{DeadLetterEnvelope, DeadLetterReason, DeadLetterRecord, DeadLetterStatus};

/// Job progress
pub use job::{JobProgressEvent, JobState, JobStatus};
