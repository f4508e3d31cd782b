//! Agent dispatch
//!
//! The [`AgentExecutor`] runs on the execution context. For one request it
//! resolves the agent configuration and active prompt, selects the workflow
//! engine from the configuration, runs it under the workflow timeout, and
//! publishes exactly one `completed` or `failed` event. Cost telemetry
//! follows a completion on a best-effort basis.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::collaborators::{AgentConfigCache, ContextFetcher, KnowledgeRetriever, LlmGateway, PromptCache};
use super::jobs::ProgressReporter;
use super::publisher::Publisher;
use super::workflows::{
    ConversationalWorkflow, ExplorerWorkflow, ExtractorWorkflow, GeneratorWorkflow,
    TieredVisionWorkflow, UsageLedger, WorkflowContext, WorkflowFailure, WorkflowOutput, WorkflowResult,
};
use crate::models::{
    AgentCompletedEvent, AgentConfig, AgentFailedEvent, AgentRequestEvent, CostRecordedEvent,
    ErrorType, PromptTemplate, WorkflowSettings,
};
use crate::Result;

/// The collaborators every workflow can reach.
pub struct AgentServices {
    pub config_cache: Arc<dyn AgentConfigCache>,
    pub prompt_cache: Arc<dyn PromptCache>,
    pub llm: Arc<dyn LlmGateway>,
    pub knowledge: Arc<dyn KnowledgeRetriever>,
    pub context: Arc<dyn ContextFetcher>,
}

/// What the caches say about a request before any workflow runs.
#[derive(Debug, Clone)]
pub enum Preflight {
    Ready {
        config: AgentConfig,
        prompt: PromptTemplate,
    },
    UnknownAgent,
    /// The agent exists but its prompt has no active version
    MissingPrompt(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchStatus {
    Completed {
        result_type: String,
        model_used: String,
    },
    Failed {
        error_type: ErrorType,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub request_id: String,
    pub agent_id: String,
    pub status: DispatchStatus,
    pub execution_time_ms: u64,
}

impl DispatchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, DispatchStatus::Completed { .. })
    }
}

pub struct AgentExecutor {
    services: Arc<AgentServices>,
    publisher: Publisher,
    workflow_timeout: Duration,
}

impl AgentExecutor {
    pub fn new(services: AgentServices, publisher: Publisher, workflow_timeout: Duration) -> Self {
        Self {
            services: Arc::new(services),
            publisher,
            workflow_timeout,
        }
    }

    pub fn services(&self) -> &Arc<AgentServices> {
        &self.services
    }

    /// Resolve configuration and prompt. Cache outages are errors.
    pub async fn preflight(&self, request: &AgentRequestEvent) -> Result<Preflight> {
        let Some(config) = self.services.config_cache.get_config(&request.agent_id).await? else {
            return Ok(Preflight::UnknownAgent);
        };
        let Some(prompt) = self.services.prompt_cache.get_active_prompt(&config.prompt_id).await? else {
            return Ok(Preflight::MissingPrompt(config.prompt_id));
        };
        Ok(Preflight::Ready { config, prompt })
    }

    pub async fn dispatch(&self, request: &AgentRequestEvent) -> Result<DispatchOutcome> {
        self.dispatch_with_progress(request, None).await
    }

    /// Full dispatch. A missing configuration or prompt is a business
    /// failure here and is published as `failed`.
    pub async fn dispatch_with_progress(
        &self,
        request: &AgentRequestEvent,
        progress: Option<ProgressReporter>,
    ) -> Result<DispatchOutcome> {
        let started = Instant::now();
        match self.preflight(request).await? {
            Preflight::Ready { config, prompt } => self.run(request, config, prompt, progress, started).await,
            Preflight::UnknownAgent => {
                let failure = WorkflowFailure::new(
                    ErrorType::ConfigNotFound,
                    format!("no configuration for agent {}", request.agent_id),
                );
                self.fail(request, failure, started).await
            }
            Preflight::MissingPrompt(prompt_id) => {
                let failure = WorkflowFailure::new(
                    ErrorType::PromptNotFound,
                    format!("no active version of prompt {}", prompt_id),
                );
                self.fail(request, failure, started).await
            }
        }
    }

    /// Dispatch with configuration and prompt already resolved.
    pub async fn dispatch_resolved(
        &self,
        request: &AgentRequestEvent,
        config: AgentConfig,
        prompt: PromptTemplate,
        progress: Option<ProgressReporter>,
    ) -> Result<DispatchOutcome> {
        self.run(request, config, prompt, progress, Instant::now()).await
    }

    async fn run(
        &self,
        request: &AgentRequestEvent,
        config: AgentConfig,
        prompt: PromptTemplate,
        progress: Option<ProgressReporter>,
        started: Instant,
    ) -> Result<DispatchOutcome> {
        info!(
            request_id = %request.request_id,
            agent_id = %request.agent_id,
            agent_type = %config.agent_type(),
            "dispatching"
        );
        let ctx = WorkflowContext::new(request.clone(), config, prompt, self.services.clone(), progress);

        let failure = match tokio::time::timeout(self.workflow_timeout, run_workflow(&ctx)).await {
            Ok(Ok(output)) => return self.complete(&ctx, output, started).await,
            Ok(Err(failure)) => failure,
            Err(_) => WorkflowFailure::new(
                ErrorType::Timeout,
                format!("workflow exceeded {:?}", self.workflow_timeout),
            ),
        };
        let outcome = self.fail(request, failure, started).await?;
        self.record_cost(request, &ctx.usage(), &ctx.config.llm.model).await;
        Ok(outcome)
    }

    async fn complete(&self, ctx: &WorkflowContext, output: WorkflowOutput, started: Instant) -> Result<DispatchOutcome> {
        let request = &ctx.request;
        if let Err(e) = output.result.validate() {
            let failure = WorkflowFailure::new(ErrorType::Validation, format!("result rejected: {}", e));
            let outcome = self.fail(request, failure, started).await?;
            self.record_cost(request, &ctx.usage(), &ctx.config.llm.model).await;
            return Ok(outcome);
        }

        let usage = ctx.usage();
        let model_used = if usage.model_used.is_empty() {
            ctx.config.llm.model.clone()
        } else {
            usage.model_used.clone()
        };
        let result_type = output.result.result_type().to_string();
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let event = AgentCompletedEvent {
            request_id: request.request_id.clone(),
            agent_id: request.agent_id.clone(),
            linkage: request.linkage.clone(),
            result: output.result,
            execution_time_ms,
            model_used: model_used.clone(),
            cost_usd: (usage.calls > 0).then_some(usage.cost_usd),
            completed_at: Utc::now(),
        };
        self.publisher.publish_completed(&event).await?;
        self.record_cost(request, &usage, &model_used).await;

        Ok(DispatchOutcome {
            request_id: request.request_id.clone(),
            agent_id: request.agent_id.clone(),
            status: DispatchStatus::Completed { result_type, model_used },
            execution_time_ms,
        })
    }

    /// Best-effort cost telemetry for a run that made at least one LLM call,
    /// whether it completed or failed.
    async fn record_cost(&self, request: &AgentRequestEvent, usage: &UsageLedger, fallback_model: &str) {
        if usage.calls == 0 {
            return;
        }
        let cost = CostRecordedEvent {
            request_id: request.request_id.clone(),
            agent_id: request.agent_id.clone(),
            model: if usage.model_used.is_empty() {
                fallback_model.to_string()
            } else {
                usage.model_used.clone()
            },
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost_usd: usage.cost_usd,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.publisher.publish_cost(&cost).await {
            warn!(request_id = %request.request_id, "cost event not published: {}", e);
        }
    }

    async fn fail(&self, request: &AgentRequestEvent, failure: WorkflowFailure, started: Instant) -> Result<DispatchOutcome> {
        debug!(request_id = %request.request_id, "workflow failed: {}", failure);
        let event = AgentFailedEvent {
            request_id: request.request_id.clone(),
            agent_id: request.agent_id.clone(),
            linkage: request.linkage.clone(),
            error_type: failure.error_type.clone(),
            error_message: failure.message.clone(),
            retry_count: failure.retry_count,
            failed_at: Utc::now(),
        };
        self.publisher.publish_failed(&event).await?;

        Ok(DispatchOutcome {
            request_id: request.request_id.clone(),
            agent_id: request.agent_id.clone(),
            status: DispatchStatus::Failed {
                error_type: failure.error_type,
                message: failure.message,
            },
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

async fn run_workflow(ctx: &WorkflowContext) -> WorkflowResult {
    match &ctx.config.workflow {
        WorkflowSettings::Extractor(settings) => ExtractorWorkflow::new(settings).run(ctx).await,
        WorkflowSettings::Explorer(settings) => ExplorerWorkflow::new(settings).run(ctx).await,
        WorkflowSettings::Generator(settings) => GeneratorWorkflow::new(settings).run(ctx).await,
        WorkflowSettings::Conversational(settings) => ConversationalWorkflow::new(settings).run(ctx).await,
        WorkflowSettings::TieredVision(settings) => TieredVisionWorkflow::new(settings).run(ctx).await,
    }
}
