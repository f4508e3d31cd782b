//! Generator: fetch context → retrieve knowledge → generate → format → emit.

use serde_json::{json, Value};
use tracing::info;

use super::{
    call_llm, fetch_context, query_text, retrieve_knowledge, step_prompt, strip_markdown,
    WorkflowContext, WorkflowFailure, WorkflowOutput, WorkflowResult,
};
use crate::models::{AgentResult, ErrorType, GeneratorResult, GeneratorSettings, OutputFormat};

enum Step {
    FetchContext,
    RetrieveKnowledge,
    Generate,
    Format,
    Emit,
}

#[derive(Default)]
struct GenerationState {
    context: Value,
    knowledge: Value,
    draft: String,
    content: String,
}

pub struct GeneratorWorkflow<'a> {
    settings: &'a GeneratorSettings,
}

impl<'a> GeneratorWorkflow<'a> {
    pub fn new(settings: &'a GeneratorSettings) -> Self {
        Self { settings }
    }

    pub async fn run(&self, ctx: &WorkflowContext) -> WorkflowResult {
        let input = &ctx.request.input_data;
        let format = input
            .get("format")
            .and_then(Value::as_str)
            .and_then(OutputFormat::parse)
            .unwrap_or(self.settings.default_format);
        let language = input
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.default_language.clone());
        let audience = input
            .get("audience")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.settings.default_audience.clone());

        let mut state = GenerationState::default();
        let mut step = Step::FetchContext;

        loop {
            step = match step {
                Step::FetchContext => {
                    ctx.report("fetching context");
                    state.context = fetch_context(ctx).await?;
                    Step::RetrieveKnowledge
                }
                Step::RetrieveKnowledge => {
                    let passages =
                        retrieve_knowledge(ctx, &query_text(input), ctx.config.rag.domains.clone()).await;
                    state.knowledge = json!(passages);
                    Step::Generate
                }
                Step::Generate => {
                    let mut vars = ctx.base_variables(&state.context);
                    vars.insert("knowledge".to_string(), state.knowledge.clone());
                    vars.insert("format".to_string(), json!(format.as_str()));
                    vars.insert("language".to_string(), json!(language));
                    vars.insert("audience".to_string(), json!(audience));
                    let prompt = step_prompt(ctx, &vars, &self.instructions(format, &language, audience.as_deref()))?;
                    let reply = call_llm(
                        ctx,
                        &ctx.completion_request(prompt),
                        format == OutputFormat::Json,
                    )
                    .await?;
                    state.draft = match reply.json {
                        Some(json) => json.to_string(),
                        None => reply.text,
                    };
                    Step::Format
                }
                Step::Format => {
                    state.content = match format {
                        OutputFormat::Json => format_json(&state.draft, ctx.prompt.output_schema.as_ref())?,
                        OutputFormat::Markdown => state.draft.trim().to_string(),
                        OutputFormat::Text => strip_markdown(&state.draft),
                        OutputFormat::Sms => format_sms(&state.draft, self.settings.sms_max_chars),
                        OutputFormat::VoiceScript => format_voice_script(&state.draft),
                    };
                    if state.content.is_empty() {
                        return Err(WorkflowFailure::new(ErrorType::Validation, "generated content is empty"));
                    }
                    Step::Emit
                }
                Step::Emit => {
                    info!(
                        request_id = %ctx.request.request_id,
                        format = format.as_str(),
                        chars = state.content.chars().count(),
                        "generation complete"
                    );
                    return Ok(WorkflowOutput {
                        result: AgentResult::Generator(GeneratorResult {
                            content: std::mem::take(&mut state.content),
                            format,
                            target_audience: audience,
                            language,
                        }),
                    });
                }
            };
        }
    }

    fn instructions(&self, format: OutputFormat, language: &str, audience: Option<&str>) -> String {
        let mut text = format!("Task: generate\nWrite in language: {}.", language);
        if let Some(audience) = audience {
            text.push_str(&format!("\nAudience: {}.", audience));
        }
        let shape = match format {
            OutputFormat::Json => "Return a single JSON object.".to_string(),
            OutputFormat::Markdown => "Format the answer as Markdown.".to_string(),
            OutputFormat::Text => "Write plain text without Markdown.".to_string(),
            OutputFormat::Sms => format!(
                "Write one short SMS message of at most {} characters.",
                self.settings.sms_max_chars
            ),
            OutputFormat::VoiceScript => {
                "Write a script to be read aloud: short plain sentences, no lists or symbols.".to_string()
            }
        };
        text.push('\n');
        text.push_str(&shape);
        text
    }
}

/// Compact JSON, with the top-level keys of `output_schema.required` present.
fn format_json(draft: &str, output_schema: Option<&Value>) -> Result<String, WorkflowFailure> {
    let value: Value = serde_json::from_str(draft)
        .map_err(|e| WorkflowFailure::new(ErrorType::Validation, format!("generated JSON is invalid: {}", e)))?;

    let required = output_schema
        .and_then(|schema| schema.get("required"))
        .and_then(Value::as_array)
        .map(|keys| keys.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    let missing: Vec<&str> = required
        .into_iter()
        .filter(|key| value.get(*key).map_or(true, Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(WorkflowFailure::new(
            ErrorType::Validation,
            format!("generated JSON is missing: {}", missing.join(", ")),
        ));
    }
    Ok(value.to_string())
}

/// One line, whitespace collapsed, at most `max_chars` characters.
fn format_sms(draft: &str, max_chars: usize) -> String {
    let single_line = strip_markdown(draft).split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut truncated: String = single_line.chars().take(max_chars.saturating_sub(1)).collect();
    truncated = truncated.trim_end().to_string();
    truncated.push('…');
    truncated
}

/// Markdown stripped, one sentence per line.
fn format_voice_script(draft: &str) -> String {
    let plain = strip_markdown(draft).split_whitespace().collect::<Vec<_>>().join(" ");
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = plain.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        let ends_sentence = matches!(c, '.' | '!' | '?') && chars.peek().map_or(true, |next| *next == ' ');
        if ends_sentence {
            lines.push(current.trim().to_string());
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        lines.push(current.trim().to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{context_for, Reply, ScriptedLlm};
    use crate::models::WorkflowSettings;
    use std::sync::Arc;

    fn settings() -> GeneratorSettings {
        GeneratorSettings {
            sms_max_chars: 40,
            ..GeneratorSettings::default()
        }
    }

    async fn generate(reply: &str, input: Value) -> WorkflowResult {
        let llm = Arc::new(ScriptedLlm::new().when("Task: generate", Reply::text(reply)));
        let ctx = context_for(WorkflowSettings::Generator(settings()), llm, input);
        GeneratorWorkflow::new(&settings()).run(&ctx).await
    }

    #[test]
    fn test_sms_truncates_by_characters() {
        let sms = format_sms("**Dry** your leaves\n\nbefore the rain arrives tomorrow morning", 20);
        assert_eq!(sms.chars().count(), 20);
        assert!(sms.ends_with('…'));
        assert!(!sms.contains('\n'));
        assert_eq!(format_sms("short", 20), "short");
    }

    #[test]
    fn test_sms_never_exceeds_tiny_limits() {
        assert_eq!(format_sms("Dry your leaves", 0), "");
        assert_eq!(format_sms("Dry your leaves", 1), "…");
        assert_eq!(format_sms("Dry your leaves", 2), "D…");
        assert_eq!(format_sms("", 0), "");
    }

    #[test]
    fn test_voice_script_one_sentence_per_line() {
        let script = format_voice_script("## Advice\nPick early. Dry the leaves! Version 2.5 is fine?");
        assert_eq!(script, "Advice Pick early.\nDry the leaves!\nVersion 2.5 is fine?");
    }

    #[test]
    fn test_json_requires_schema_keys() {
        let schema = json!({"required": ["title", "steps"]});
        let compact = format_json("{\n  \"title\": \"x\",\n  \"steps\": []\n}", Some(&schema)).unwrap();
        assert!(!compact.contains('\n'));
        assert_eq!(serde_json::from_str::<Value>(&compact).unwrap(), json!({"title": "x", "steps": []}));
        let failure = format_json(r#"{"title": "x"}"#, Some(&schema)).unwrap_err();
        assert_eq!(failure.error_type, ErrorType::Validation);
        assert!(failure.message.contains("steps"));
    }

    #[tokio::test]
    async fn test_format_from_input_overrides_default() {
        let output = generate("# Tip\n- Prune **weekly**", json!({"topic": "pruning", "format": "text", "language": "sw"}))
            .await
            .unwrap();
        let AgentResult::Generator(result) = output.result else {
            panic!("expected generator result");
        };
        assert_eq!(result.format, OutputFormat::Text);
        assert_eq!(result.content, "Tip\nPrune weekly");
        assert_eq!(result.language, "sw");
    }

    #[tokio::test]
    async fn test_sms_mode_respects_configured_limit() {
        let long = "Harvest the two leaves and a bud only, and deliver before noon to keep quality high.";
        let output = generate(long, json!({"format": "sms"})).await.unwrap();
        let AgentResult::Generator(result) = output.result else {
            panic!("expected generator result");
        };
        assert_eq!(result.format, OutputFormat::Sms);
        assert!(result.content.chars().count() <= 40);
    }
}
