// Workflow engines
// One engine per agent type, each an ordered set of steps over its own state

//! # Workflow Engines
//!
//! Every engine follows the same shape: a small `Step` enum, a state struct
//! scoped to one execution, and a loop that advances from step to step until
//! it reaches `Completed` or `Failed`. The pieces they share live here:
//!
//! - [`WorkflowContext`]: the request, its configuration and prompt, and the
//!   collaborators, for the duration of one run
//! - [`WorkflowFailure`]: the business failure that becomes an
//!   `AgentFailedEvent`
//! - [`call_llm`]: per-call timeout plus bounded retries around the gateway
//! - [`render_prompt`]: Handlebars rendering of the prompt template
//! - [`fetch_context`] / [`retrieve_knowledge`]: the common first steps

pub mod conversational;
pub mod explorer;
pub mod extractor;
pub mod generator;
pub mod tiered_vision;

use handlebars::Handlebars;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::collaborators::{KnowledgeQuery, Passage};
use super::dispatcher::AgentServices;
use super::jobs::ProgressReporter;
use crate::llm::{Completion, CompletionRequest, LLMError};
use crate::models::{AgentConfig, AgentRequestEvent, AgentResult, ErrorType, PromptTemplate};

pub use conversational::ConversationalWorkflow;
pub use explorer::ExplorerWorkflow;
pub use extractor::ExtractorWorkflow;
pub use generator::GeneratorWorkflow;
pub use tiered_vision::TieredVisionWorkflow;

/// Everything one workflow run can see.
pub struct WorkflowContext {
    pub request: AgentRequestEvent,
    pub config: AgentConfig,
    pub prompt: PromptTemplate,
    pub services: Arc<AgentServices>,
    pub progress: Option<ProgressReporter>,
    /// Every completed LLM call of the run, including calls whose step was
    /// later cancelled by a deadline
    usage: Mutex<UsageLedger>,
}

impl WorkflowContext {
    pub fn new(
        request: AgentRequestEvent,
        config: AgentConfig,
        prompt: PromptTemplate,
        services: Arc<AgentServices>,
        progress: Option<ProgressReporter>,
    ) -> Self {
        Self {
            request,
            config,
            prompt,
            services,
            progress,
            usage: Mutex::new(UsageLedger::default()),
        }
    }

    pub fn record_usage(&self, completion: &Completion) {
        self.usage.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).record(completion);
    }

    /// Usage so far.
    pub fn usage(&self) -> UsageLedger {
        self.usage.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn report(&self, message: &str) {
        if let Some(progress) = &self.progress {
            progress.running(message);
        }
    }

    /// Request for the configured model with the prompt's system text.
    pub fn completion_request(&self, prompt: String) -> CompletionRequest {
        CompletionRequest::new(self.config.llm.model.clone(), prompt)
            .with_system(self.prompt.system_prompt.clone())
            .with_limits(self.config.llm.temperature, self.config.llm.max_tokens)
    }

    /// Variables available to every prompt template.
    pub fn base_variables(&self, context: &Value) -> Map<String, Value> {
        let mut vars = Map::new();
        vars.insert("agent_id".to_string(), json!(self.config.agent_id));
        vars.insert("request_id".to_string(), json!(self.request.request_id));
        vars.insert("source".to_string(), json!(self.request.source));
        vars.insert("linkage".to_string(), json!(self.request.linkage));
        vars.insert("input".to_string(), self.request.input_data.clone());
        vars.insert("input_json".to_string(), json!(pretty(&self.request.input_data)));
        vars.insert("context".to_string(), context.clone());
        vars.insert("context_json".to_string(), json!(pretty(context)));
        vars
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// What a successful run hands to the publisher. Usage is read from the
/// context.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOutput {
    pub result: AgentResult,
}

/// Token and cost totals over every LLM call of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageLedger {
    pub model_used: String,
    pub calls: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

impl UsageLedger {
    pub fn record(&mut self, completion: &Completion) {
        self.model_used = completion.model.clone();
        self.calls += 1;
        self.tokens_in += completion.tokens_in;
        self.tokens_out += completion.tokens_out;
        self.cost_usd += completion.cost_usd;
    }
}

/// Terminal `failed` state of a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowFailure {
    pub error_type: ErrorType,
    pub message: String,
    pub retry_count: u32,
}

impl WorkflowFailure {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            retry_count: 0,
        }
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

impl std::fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

pub type WorkflowResult = std::result::Result<WorkflowOutput, WorkflowFailure>;

/// Render a Handlebars template against `vars`. Output is not HTML-escaped.
pub fn render_prompt(template: &str, vars: &Map<String, Value>) -> Result<String, WorkflowFailure> {
    let mut hbs = Handlebars::new();
    hbs.register_escape_fn(handlebars::no_escape);
    hbs.render_template(template, vars).map_err(|e| {
        WorkflowFailure::new(ErrorType::from("template_error"), format!("prompt template: {}", e))
    })
}

/// Rendered prompt followed by the step's own instructions.
pub fn step_prompt(ctx: &WorkflowContext, vars: &Map<String, Value>, instructions: &str) -> Result<String, WorkflowFailure> {
    let rendered = render_prompt(&ctx.prompt.template, vars)?;
    Ok(format!("{}\n\n{}", rendered.trim_end(), instructions))
}

/// A completed LLM call.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    /// Present when JSON was requested
    pub json: Option<Value>,
}

/// Call the gateway with the agent's per-call timeout and retry budget.
/// Every completion is recorded on the context's usage, parseable or not.
///
/// Transient gateway errors, per-call timeouts and (when `expect_json`)
/// unparseable output each consume one attempt. A non-transient gateway
/// error fails immediately. Exhaustion is `timeout` if the last attempt timed
/// out, otherwise `llm_error`.
pub async fn call_llm(
    ctx: &WorkflowContext,
    request: &CompletionRequest,
    expect_json: bool,
) -> Result<LlmReply, WorkflowFailure> {
    let per_call = Duration::from_secs(ctx.config.llm.timeout_seconds.max(1));
    let attempts = ctx.config.llm.max_retries + 1;
    let mut last_failure = WorkflowFailure::new(ErrorType::LlmError, "no attempt made");

    for attempt in 1..=attempts {
        let outcome = tokio::time::timeout(per_call, ctx.services.llm.complete(request)).await;
        let retry_count = attempt - 1;
        match outcome {
            Ok(Ok(completion)) => {
                ctx.record_usage(&completion);
                if !expect_json {
                    return Ok(LlmReply {
                        text: completion.text,
                        json: None,
                    });
                }
                match parse_json_response(&completion.text) {
                    Some(json) => {
                        return Ok(LlmReply {
                            text: completion.text,
                            json: Some(json),
                        })
                    }
                    None => {
                        warn!(request_id = %ctx.request.request_id, attempt, "LLM reply is not JSON");
                        last_failure = WorkflowFailure::new(
                            ErrorType::LlmError,
                            "model did not return valid JSON",
                        )
                        .with_retries(retry_count);
                    }
                }
            }
            Ok(Err(e)) if !e.is_transient() => {
                return Err(WorkflowFailure::new(ErrorType::LlmError, e.to_string()).with_retries(retry_count));
            }
            Ok(Err(e)) => {
                warn!(request_id = %ctx.request.request_id, attempt, "LLM call failed: {}", e);
                let error_type = if matches!(e, LLMError::Timeout(_)) {
                    ErrorType::Timeout
                } else {
                    ErrorType::LlmError
                };
                last_failure = WorkflowFailure::new(error_type, e.to_string()).with_retries(retry_count);
            }
            Err(_) => {
                warn!(request_id = %ctx.request.request_id, attempt, ?per_call, "LLM call timed out");
                last_failure = WorkflowFailure::new(
                    ErrorType::Timeout,
                    format!("LLM call exceeded {:?}", per_call),
                )
                .with_retries(retry_count);
            }
        }
    }
    Err(last_failure)
}

/// Parse a model reply as JSON, tolerating Markdown code fences and prose
/// around a single top-level object.
pub fn parse_json_response(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim);
    if let Some(inner) = unfenced {
        if let Ok(value) = serde_json::from_str::<Value>(inner) {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Fetch step: run every configured context tool against the linkage.
///
/// Missing records are skipped; a failing tool fails the run with
/// `context_unavailable`. The caller-supplied `context` is kept under
/// `request_context`.
pub async fn fetch_context(ctx: &WorkflowContext) -> Result<Value, WorkflowFailure> {
    let mut fetched = Map::new();
    for tool in &ctx.config.context_tools {
        match ctx.services.context.fetch(tool, &ctx.request.linkage).await {
            Ok(Some(record)) => {
                fetched.insert(tool.clone(), record);
            }
            Ok(None) => debug!(tool = %tool, linkage = %ctx.request.linkage, "no context record"),
            Err(e) => {
                return Err(WorkflowFailure::new(
                    ErrorType::ContextUnavailable,
                    format!("context tool {} failed: {}", tool, e),
                ))
            }
        }
    }
    if let Some(request_context) = &ctx.request.context {
        fetched.insert("request_context".to_string(), request_context.clone());
    }
    Ok(Value::Object(fetched))
}

/// Retrieval step. Retrieval trouble degrades to no passages rather than
/// failing the run.
pub async fn retrieve_knowledge(ctx: &WorkflowContext, text: &str, domains: Vec<String>) -> Vec<Passage> {
    if !ctx.config.rag.enabled {
        return vec![];
    }
    let query = KnowledgeQuery {
        text: text.to_string(),
        domains,
        top_k: ctx.config.rag.top_k,
    };
    match ctx.services.knowledge.query(&query).await {
        Ok(passages) => passages,
        Err(e) => {
            warn!(request_id = %ctx.request.request_id, "knowledge retrieval failed: {}", e);
            vec![]
        }
    }
}

/// Text worth searching the knowledge base with: string inputs verbatim,
/// otherwise every string leaf of the input.
pub fn query_text(input: &Value) -> String {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map.values().for_each(|v| collect(v, out)),
            _ => {}
        }
    }
    let mut parts = Vec::new();
    collect(input, &mut parts);
    parts.join(" ")
}

/// String array from a JSON field, skipping non-strings.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Strip common Markdown: headings, list markers, emphasis, inline code,
/// links (kept as their text) and code fences.
pub fn strip_markdown(text: &str) -> String {
    let mut lines = Vec::new();
    for line in text.lines() {
        let mut line = line.trim();
        if line.starts_with("```") {
            continue;
        }
        line = line.trim_start_matches('#').trim_start();
        line = line.strip_prefix("> ").unwrap_or(line);
        for marker in ["- ", "* ", "+ "] {
            if let Some(rest) = line.strip_prefix(marker) {
                line = rest;
                break;
            }
        }
        let without_number = line
            .split_once(". ")
            .filter(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .map(|(_, rest)| rest)
            .unwrap_or(line);
        lines.push(strip_inline_markdown(without_number));
    }
    lines.join("\n").trim().to_string()
}

fn strip_inline_markdown(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' | '`' => i += 1,
            '_' if i + 1 < chars.len() && chars[i + 1] == '_' => i += 2,
            '[' => {
                // [text](url) -> text
                let close = chars[i..].iter().position(|&c| c == ']').map(|p| p + i);
                match close {
                    Some(close) if chars.get(close + 1) == Some(&'(') => {
                        let end = chars[close..].iter().position(|&c| c == ')').map(|p| p + close);
                        out.extend(&chars[i + 1..close]);
                        i = end.map_or(close + 1, |end| end + 1);
                    }
                    _ => {
                        out.push('[');
                        i += 1;
                    }
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_tolerates_fences_and_prose() {
        assert_eq!(parse_json_response("{\"a\":1}"), Some(json!({"a": 1})));
        assert_eq!(
            parse_json_response("```json\n{\"a\": 2}\n```"),
            Some(json!({"a": 2}))
        );
        assert_eq!(
            parse_json_response("Here you go: {\"a\": 3} hope it helps"),
            Some(json!({"a": 3}))
        );
        assert_eq!(parse_json_response("no json here"), None);
    }

    #[test]
    fn test_render_does_not_escape() {
        let mut vars = Map::new();
        vars.insert("input".to_string(), json!({"text": "grade \"A\" & <dry>"}));
        let rendered = render_prompt("Note: {{input.text}}", &vars).unwrap();
        assert_eq!(rendered, "Note: grade \"A\" & <dry>");
    }

    #[test]
    fn test_render_error_is_a_failure() {
        let failure = render_prompt("{{#if}}", &Map::new()).unwrap_err();
        assert_eq!(failure.error_type.as_str(), "template_error");
    }

    #[test]
    fn test_strip_markdown() {
        let text = "# Advice\n\n- **Dry** the leaves\n2. See [guide](http://x)\n```\ncode\n```";
        assert_eq!(strip_markdown(text), "Advice\n\nDry the leaves\nSee guide\ncode");
        assert_eq!(strip_markdown("snake_case stays"), "snake_case stays");
    }

    #[test]
    fn test_query_text_collects_strings() {
        let text = query_text(&json!({"symptoms": ["yellow spots", "curling"], "count": 3}));
        assert!(text.contains("yellow spots"));
        assert!(text.contains("curling"));
    }

    #[test]
    fn test_ledger_accumulates() {
        let mut total = UsageLedger::default();
        let completion = Completion {
            text: String::new(),
            model: "m".to_string(),
            tokens_in: 10,
            tokens_out: 5,
            cost_usd: 0.5,
        };
        total.record(&completion);
        total.record(&completion);
        assert_eq!(total.calls, 2);
        assert_eq!(total.tokens_in, 20);
        assert_eq!(total.model_used, "m");
    }
}
