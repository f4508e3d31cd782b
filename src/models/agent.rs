use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::result::OutputFormat;

/// Workflow family an agent configuration declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Extractor,
    Explorer,
    Generator,
    Conversational,
    TieredVision,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AgentType::Extractor => "extractor",
            AgentType::Explorer => "explorer",
            AgentType::Generator => "generator",
            AgentType::Conversational => "conversational",
            AgentType::TieredVision => "tiered_vision",
        };
        f.write_str(label)
    }
}

/// LLM generation parameters for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-call timeout
    pub timeout_seconds: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-haiku-20240307".to_string(),
            temperature: 0.1,
            max_tokens: 1024,
            timeout_seconds: 30,
            max_retries: 2,
        }
    }
}

/// Retrieval settings shared by the knowledge-using workflows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub domains: Vec<String>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            top_k: 5,
            domains: vec![],
        }
    }
}

/// Expected type of one extracted field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Array,
    Object,
}

/// Normalization applied to a field after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    Trim,
    Lowercase,
    Uppercase,
    /// Coerce numeric strings such as `"12.5 kg"` into numbers
    Numeric,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSchema {
    pub required: Vec<String>,
    pub fields: BTreeMap<String, FieldType>,
    pub normalize: BTreeMap<String, Normalization>,
    /// Unknown fields are dropped with a warning instead of kept
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorSettings {
    pub schema: FieldSchema,
    /// Extra extraction attempts after a schema violation
    pub validation_retries: u32,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            schema: FieldSchema::default(),
            validation_retries: 1,
        }
    }
}

/// One analyzer of the explorer's fan-out branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerSpec {
    pub name: String,
    /// What the analyzer should concentrate on; rendered into its prompt
    pub focus: String,
    /// Knowledge domain the analyzer retrieves passages from
    #[serde(default)]
    pub knowledge_domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerSettings {
    /// Triage confidence at or above which a single analyzer is enough
    pub confidence_threshold: f64,
    /// The first analyzer is the primary one used on the single branch
    pub analyzers: Vec<AnalyzerSpec>,
    /// Shared deadline of the parallel branch
    pub analyzer_deadline_ms: u64,
}

impl Default for ExplorerSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            analyzers: vec![AnalyzerSpec {
                name: "general".to_string(),
                focus: "overall root cause".to_string(),
                knowledge_domain: None,
            }],
            analyzer_deadline_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub default_format: OutputFormat,
    pub default_language: String,
    pub default_audience: Option<String>,
    pub sms_max_chars: usize,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            default_format: OutputFormat::Text,
            default_language: "en".to_string(),
            default_audience: None,
            sms_max_chars: 160,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationalSettings {
    pub intents: Vec<String>,
    pub fallback_intent: String,
    pub max_history_turns: usize,
}

impl Default for ConversationalSettings {
    fn default() -> Self {
        Self {
            intents: vec![],
            fallback_intent: "unknown".to_string(),
            max_history_turns: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredVisionSettings {
    pub screen_model: String,
    pub diagnose_model: String,
    /// Screen confidence below this escalates to the diagnose tier
    pub escalation_threshold: f64,
}

impl Default for TieredVisionSettings {
    fn default() -> Self {
        Self {
            screen_model: "claude-3-haiku-20240307".to_string(),
            diagnose_model: "claude-3-5-sonnet-20241022".to_string(),
            escalation_threshold: 0.8,
        }
    }
}

/// Type-specific workflow settings, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowSettings {
    Extractor(ExtractorSettings),
    Explorer(ExplorerSettings),
    Generator(GeneratorSettings),
    Conversational(ConversationalSettings),
    TieredVision(TieredVisionSettings),
}

impl WorkflowSettings {
    pub fn agent_type(&self) -> AgentType {
        match self {
            WorkflowSettings::Extractor(_) => AgentType::Extractor,
            WorkflowSettings::Explorer(_) => AgentType::Explorer,
            WorkflowSettings::Generator(_) => AgentType::Generator,
            WorkflowSettings::Conversational(_) => AgentType::Conversational,
            WorkflowSettings::TieredVision(_) => AgentType::TieredVision,
        }
    }
}

/// Agent configuration as served by the configuration cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub prompt_id: String,
    #[serde(default)]
    pub llm: LLMConfig,
    #[serde(default)]
    pub rag: RagConfig,
    /// Linkage lookups the fetch-context step performs, e.g. `farmer`, `region`
    #[serde(default)]
    pub context_tools: Vec<String>,
    pub workflow: WorkflowSettings,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, prompt_id: impl Into<String>, workflow: WorkflowSettings) -> Self {
        Self {
            agent_id: agent_id.into(),
            version: default_version(),
            description: String::new(),
            prompt_id: prompt_id.into(),
            llm: LLMConfig::default(),
            rag: RagConfig::default(),
            context_tools: vec![],
            workflow,
        }
    }

    pub fn agent_type(&self) -> AgentType {
        self.workflow.agent_type()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStatus {
    Active,
    Draft,
    Archived,
}

/// Prompt template as served by the prompt cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub prompt_id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_prompt_status")]
    pub status: PromptStatus,
    #[serde(default)]
    pub system_prompt: String,
    /// Handlebars template rendered against the step's variables
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

fn default_prompt_status() -> PromptStatus {
    PromptStatus::Active
}

impl PromptTemplate {
    pub fn new(prompt_id: impl Into<String>, system_prompt: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            version: default_version(),
            status: PromptStatus::Active,
            system_prompt: system_prompt.into(),
            template: template.into(),
            output_schema: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PromptStatus::Active
    }
}
