//! External collaborators
//!
//! The workflows depend on five narrow interfaces. The service wires in the
//! file-backed implementations below; anything with the same shape (a remote
//! cache, a vector store) can be swapped in without touching the engines.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::models::{AgentConfig, EntityLinkage, PromptTemplate};
use crate::{AiModelError, Result};

pub use crate::llm::LlmGateway;

#[async_trait]
pub trait AgentConfigCache: Send + Sync {
    async fn get_config(&self, agent_id: &str) -> Result<Option<AgentConfig>>;
}

#[async_trait]
pub trait PromptCache: Send + Sync {
    /// The active version of a prompt, if one exists
    async fn get_active_prompt(&self, prompt_id: &str) -> Result<Option<PromptTemplate>>;
}

/// A retrieved piece of domain knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    /// Citation reported in `rag_sources_used`
    pub source: String,
    pub domain: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeQuery {
    pub text: String,
    /// Empty means any domain
    pub domains: Vec<String>,
    pub top_k: usize,
}

#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn query(&self, query: &KnowledgeQuery) -> Result<Vec<Passage>>;
}

/// Looks up domain records (farmer profile, region weather, ...) for a linkage.
#[async_trait]
pub trait ContextFetcher: Send + Sync {
    /// `Ok(None)` when the linkage has no identifier for this tool or no
    /// record exists.
    async fn fetch(&self, tool: &str, linkage: &EntityLinkage) -> Result<Option<Value>>;
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AiModelError::Collaborator(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&raw)?)
}

/// Agent configurations and prompts loaded once from JSON files.
#[derive(Debug, Default, Clone)]
pub struct FileCatalog {
    configs: HashMap<String, AgentConfig>,
    prompts: HashMap<String, Vec<PromptTemplate>>,
}

impl FileCatalog {
    pub fn from_parts(configs: Vec<AgentConfig>, prompts: Vec<PromptTemplate>) -> Self {
        let mut catalog = Self::default();
        for config in configs {
            catalog.configs.insert(config.agent_id.clone(), config);
        }
        for prompt in prompts {
            catalog.prompts.entry(prompt.prompt_id.clone()).or_default().push(prompt);
        }
        catalog
    }

    /// `agents_path` holds a JSON array of agent configs, `prompts_path` a
    /// JSON array of prompt templates (several versions per id allowed).
    pub fn from_paths(agents_path: &Path, prompts_path: &Path) -> Result<Self> {
        let configs: Vec<AgentConfig> = read_json(agents_path)?;
        let prompts: Vec<PromptTemplate> = read_json(prompts_path)?;
        info!(
            agents = configs.len(),
            prompts = prompts.len(),
            "loaded agent catalog from {}",
            agents_path.display()
        );
        Ok(Self::from_parts(configs, prompts))
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.configs.keys().map(String::as_str).collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl AgentConfigCache for FileCatalog {
    async fn get_config(&self, agent_id: &str) -> Result<Option<AgentConfig>> {
        Ok(self.configs.get(agent_id).cloned())
    }
}

#[async_trait]
impl PromptCache for FileCatalog {
    async fn get_active_prompt(&self, prompt_id: &str) -> Result<Option<PromptTemplate>> {
        Ok(self
            .prompts
            .get(prompt_id)
            .and_then(|versions| versions.iter().rev().find(|p| p.is_active()))
            .cloned())
    }
}

/// Keyword-scored knowledge base over a fixed passage list.
#[derive(Debug, Default, Clone)]
pub struct StaticKnowledgeBase {
    passages: Vec<Passage>,
}

impl StaticKnowledgeBase {
    pub fn new(passages: Vec<Passage>) -> Self {
        Self { passages }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::new(read_json(path)?))
    }
}

fn keywords(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl KnowledgeRetriever for StaticKnowledgeBase {
    async fn query(&self, query: &KnowledgeQuery) -> Result<Vec<Passage>> {
        let terms = keywords(&query.text);
        let mut scored: Vec<Passage> = self
            .passages
            .iter()
            .filter(|p| query.domains.is_empty() || query.domains.contains(&p.domain))
            .filter_map(|p| {
                let haystack = p.text.to_lowercase();
                let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (hits > 0 || terms.is_empty()).then(|| Passage {
                    score: hits as f64 / terms.len().max(1) as f64,
                    ..p.clone()
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(query.top_k);
        debug!(hits = scored.len(), domains = ?query.domains, "knowledge query");
        Ok(scored)
    }
}

/// Entity records keyed by `"{tool}:{id}"`, e.g. `"farmer:WM-0001"`.
#[derive(Debug, Default, Clone)]
pub struct StaticContextFetcher {
    records: HashMap<String, Value>,
}

impl StaticContextFetcher {
    pub fn new(records: HashMap<String, Value>) -> Self {
        Self { records }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::new(read_json(path)?))
    }

    pub fn with_record(mut self, tool: &str, id: &str, record: Value) -> Self {
        self.records.insert(format!("{}:{}", tool, id), record);
        self
    }
}

/// Which linkage identifier a context tool looks up.
fn linkage_id<'a>(tool: &str, linkage: &'a EntityLinkage) -> Option<&'a str> {
    let id = match tool {
        "farmer" => linkage.farmer_id.as_deref(),
        "region" => linkage.region_id.as_deref(),
        "group" => linkage.group_id.as_deref(),
        "collection_point" => linkage.collection_point_id.as_deref(),
        "factory" => linkage.factory_id.as_deref(),
        _ => None,
    };
    id.map(str::trim).filter(|id| !id.is_empty())
}

#[async_trait]
impl ContextFetcher for StaticContextFetcher {
    async fn fetch(&self, tool: &str, linkage: &EntityLinkage) -> Result<Option<Value>> {
        let Some(id) = linkage_id(tool, linkage) else {
            return Ok(None);
        };
        Ok(self.records.get(&format!("{}:{}", tool, id)).cloned())
    }
}
