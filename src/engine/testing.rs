//! Test doubles shared by the engine's unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::collaborators::{
    AgentConfigCache, ContextFetcher, FileCatalog, KnowledgeRetriever, PromptCache,
    StaticContextFetcher, StaticKnowledgeBase,
};
use super::dispatcher::AgentServices;
use super::workflows::WorkflowContext;
use crate::llm::{Completion, CompletionRequest, LLMError, LLMResult, LlmGateway};
use crate::models::{
    AgentConfig, AgentRequestEvent, EntityLinkage, PromptTemplate, WorkflowSettings,
};
use crate::{AiModelError, Result};

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Error(LLMError),
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    pub fn error(error: LLMError) -> Self {
        Reply::Error(error)
    }

    pub fn delayed(delay: Duration, reply: Reply) -> Self {
        Reply::Delayed(delay, Box::new(reply))
    }
}

struct Rule {
    pattern: String,
    reply: Reply,
    /// `None` for rules that never run out
    uses_left: Option<AtomicUsize>,
}

/// Gateway answering from a script: the first rule whose pattern occurs in
/// the prompt (and that is not used up) wins. Unmatched prompts get a
/// non-transient error.
#[derive(Default)]
pub struct ScriptedLlm {
    rules: Vec<Rule>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, pattern: &str, reply: Reply) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            reply,
            uses_left: None,
        });
        self
    }

    /// Like [`ScriptedLlm::when`], but answers only the first matching call.
    pub fn once(mut self, pattern: &str, reply: Reply) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            reply,
            uses_left: Some(AtomicUsize::new(1)),
        });
        self
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmGateway for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> LLMResult<Completion> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let rule = self.rules.iter().find(|rule| {
            request.prompt.contains(rule.pattern.as_str())
                && rule.uses_left.as_ref().map_or(true, |left| {
                    left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
                })
        });
        let Some(rule) = rule else {
            return Err(LLMError::InvalidRequest("no scripted reply".to_string()));
        };

        let mut reply = rule.reply.clone();
        loop {
            match reply {
                Reply::Text(text) => {
                    return Ok(Completion {
                        text,
                        model: request.model.clone(),
                        tokens_in: 100,
                        tokens_out: 20,
                        cost_usd: 0.001,
                    })
                }
                Reply::Error(error) => return Err(error),
                Reply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }
}

/// Config cache that is always unreachable.
pub struct UnreachableCache;

#[async_trait]
impl AgentConfigCache for UnreachableCache {
    async fn get_config(&self, _agent_id: &str) -> Result<Option<AgentConfig>> {
        Err(AiModelError::Collaborator("config cache unreachable".to_string()))
    }
}

#[async_trait]
impl PromptCache for UnreachableCache {
    async fn get_active_prompt(&self, _prompt_id: &str) -> Result<Option<PromptTemplate>> {
        Err(AiModelError::Collaborator("prompt cache unreachable".to_string()))
    }
}

#[async_trait]
impl ContextFetcher for UnreachableCache {
    async fn fetch(&self, _tool: &str, _linkage: &EntityLinkage) -> Result<Option<Value>> {
        Err(AiModelError::Collaborator("context service unreachable".to_string()))
    }
}

pub fn test_prompt(prompt_id: &str) -> PromptTemplate {
    PromptTemplate::new(
        prompt_id,
        "You are an agricultural assistant.",
        "Input:\n{{input_json}}\nContext:\n{{context_json}}",
    )
}

pub fn services(catalog: FileCatalog, llm: Arc<dyn LlmGateway>) -> AgentServices {
    services_with(
        catalog,
        llm,
        Arc::new(StaticKnowledgeBase::default()),
        Arc::new(StaticContextFetcher::default()),
    )
}

pub fn services_with(
    catalog: FileCatalog,
    llm: Arc<dyn LlmGateway>,
    knowledge: Arc<dyn KnowledgeRetriever>,
    context: Arc<dyn ContextFetcher>,
) -> AgentServices {
    let catalog = Arc::new(catalog);
    AgentServices {
        config_cache: catalog.clone(),
        prompt_cache: catalog,
        llm,
        knowledge,
        context,
    }
}

/// A ready-to-run context for an agent named `test-agent`.
pub fn context_for(settings: WorkflowSettings, llm: Arc<ScriptedLlm>, input: Value) -> WorkflowContext {
    let config = AgentConfig::new("test-agent", "test-prompt", settings);
    let prompt = test_prompt("test-prompt");
    let services = services(FileCatalog::from_parts(vec![config.clone()], vec![prompt.clone()]), llm);
    WorkflowContext::new(
        AgentRequestEvent::new("req-test", "test-agent", EntityLinkage::for_farmer("WM-0001"), input),
        config,
        prompt,
        Arc::new(services),
        None,
    )
}
