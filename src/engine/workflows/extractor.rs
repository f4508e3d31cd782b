//! Extractor: fetch context → extract → validate → normalize → emit.
//!
//! The model is asked for a flat JSON object of fields. Schema violations
//! (missing required fields, wrong types) send the run back to extraction
//! with the problems appended to the prompt, up to `validation_retries`
//! extra attempts. Multi-page input (`input_data.pages`) is extracted page
//! by page; for each field the first page that yields a value wins.

use chrono::{DateTime, NaiveDate};
use serde_json::{json, Map, Number, Value};
use tracing::{debug, info};

use super::{
    call_llm, fetch_context, step_prompt, WorkflowContext, WorkflowFailure,
    WorkflowOutput, WorkflowResult,
};
use crate::models::{
    AgentResult, ErrorType, ExtractorResult, ExtractorSettings, FieldSchema, FieldType,
    Normalization,
};

enum Step {
    FetchContext,
    Extract,
    Validate,
    Normalize,
    Emit,
}

#[derive(Default)]
struct ExtractionState {
    context: Value,
    fields: Map<String, Value>,
    warnings: Vec<String>,
    errors: Vec<String>,
    validation_attempts: u32,
    normalization_applied: bool,
}

pub struct ExtractorWorkflow<'a> {
    settings: &'a ExtractorSettings,
}

impl<'a> ExtractorWorkflow<'a> {
    pub fn new(settings: &'a ExtractorSettings) -> Self {
        Self { settings }
    }

    pub async fn run(&self, ctx: &WorkflowContext) -> WorkflowResult {
        let mut state = ExtractionState::default();
        let mut step = Step::FetchContext;

        loop {
            step = match step {
                Step::FetchContext => {
                    ctx.report("fetching context");
                    state.context = fetch_context(ctx).await?;
                    Step::Extract
                }
                Step::Extract => {
                    state.fields = self.extract(ctx, &mut state).await?;
                    Step::Validate
                }
                Step::Validate => {
                    let (warnings, errors) = validate(&self.settings.schema, &mut state.fields);
                    state.warnings = warnings;
                    if errors.is_empty() {
                        state.errors.clear();
                        Step::Normalize
                    } else if state.validation_attempts < self.settings.validation_retries {
                        state.validation_attempts += 1;
                        debug!(
                            request_id = %ctx.request.request_id,
                            attempt = state.validation_attempts,
                            "schema violations, re-extracting: {:?}",
                            errors
                        );
                        state.errors = errors;
                        Step::Extract
                    } else {
                        return Err(WorkflowFailure::new(
                            ErrorType::Validation,
                            format!("extraction failed schema validation: {}", errors.join("; ")),
                        )
                        .with_retries(state.validation_attempts));
                    }
                }
                Step::Normalize => {
                    state.normalization_applied = normalize(&self.settings.schema, &mut state.fields);
                    Step::Emit
                }
                Step::Emit => {
                    info!(
                        request_id = %ctx.request.request_id,
                        fields = state.fields.len(),
                        "extraction complete"
                    );
                    return Ok(WorkflowOutput {
                        result: AgentResult::Extractor(ExtractorResult {
                            extracted_fields: std::mem::take(&mut state.fields),
                            validation_warnings: std::mem::take(&mut state.warnings),
                            validation_errors: vec![],
                            normalization_applied: state.normalization_applied,
                        }),
                    });
                }
            };
        }
    }

    async fn extract(&self, ctx: &WorkflowContext, state: &mut ExtractionState) -> Result<Map<String, Value>, WorkflowFailure> {
        let pages = pages(&ctx.request.input_data);
        let Some(pages) = pages else {
            let vars = ctx.base_variables(&state.context);
            return self.extract_one(ctx, vars, &state.errors).await;
        };

        if let Some(progress) = &ctx.progress {
            progress.pages_total(pages.len() as u32);
        }
        let mut merged = Map::new();
        for (index, page) in pages.iter().enumerate() {
            let mut vars = ctx.base_variables(&state.context);
            vars.insert("page".to_string(), page.clone());
            vars.insert("page_number".to_string(), json!(index + 1));
            vars.insert("page_count".to_string(), json!(pages.len()));
            let fields = self.extract_one(ctx, vars, &state.errors).await?;
            for (name, value) in fields {
                let taken = merged.get(&name).map_or(false, |existing| !existing.is_null());
                if !taken {
                    merged.insert(name, value);
                }
            }
            if let Some(progress) = &ctx.progress {
                progress.page_done(index as u32 + 1);
            }
        }
        Ok(merged)
    }

    async fn extract_one(
        &self,
        ctx: &WorkflowContext,
        vars: Map<String, Value>,
        previous_errors: &[String],
    ) -> Result<Map<String, Value>, WorkflowFailure> {
        let prompt = step_prompt(ctx, &vars, &self.instructions(vars.contains_key("page"), previous_errors))?;
        let reply = call_llm(ctx, &ctx.completion_request(prompt), true).await?;
        match reply.json {
            Some(Value::Object(fields)) => Ok(fields),
            _ => Err(WorkflowFailure::new(
                ErrorType::LlmError,
                "extraction reply is not a JSON object",
            )),
        }
    }

    fn instructions(&self, paged: bool, previous_errors: &[String]) -> String {
        let schema = &self.settings.schema;
        let mut text = String::from("Task: extract\nReturn a single flat JSON object of extracted fields.");
        if !schema.fields.is_empty() {
            let described: Vec<String> = schema
                .fields
                .iter()
                .map(|(name, kind)| format!("{} ({:?})", name, kind).to_lowercase())
                .collect();
            text.push_str(&format!("\nFields: {}.", described.join(", ")));
        }
        if !schema.required.is_empty() {
            text.push_str(&format!("\nRequired: {}.", schema.required.join(", ")));
        }
        if paged {
            text.push_str("\nOnly use the current page. Use null for fields not on this page.");
        }
        if !previous_errors.is_empty() {
            text.push_str("\nThe previous attempt had these problems, fix them:\n- ");
            text.push_str(&previous_errors.join("\n- "));
        }
        text
    }
}

/// `input_data.pages` as a list, if the input is multi-page.
fn pages(input: &Value) -> Option<Vec<Value>> {
    input
        .get("pages")
        .and_then(Value::as_array)
        .filter(|pages| !pages.is_empty())
        .cloned()
}

/// Check fields against the schema. Returns `(warnings, errors)`; strict
/// schemas drop unknown fields.
fn validate(schema: &FieldSchema, fields: &mut Map<String, Value>) -> (Vec<String>, Vec<String>) {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    for name in &schema.required {
        if fields.get(name).map_or(true, Value::is_null) {
            errors.push(format!("missing required field: {}", name));
        }
    }

    for (name, kind) in &schema.fields {
        let Some(value) = fields.get(name) else { continue };
        if value.is_null() {
            continue;
        }
        let numeric_ok = schema.normalize.get(name) == Some(&Normalization::Numeric)
            && value.as_str().and_then(leading_number).is_some();
        if !matches_type(*kind, value) && !numeric_ok {
            errors.push(format!("field {} should be {:?}, got {}", name, kind, value).to_lowercase());
        }
    }

    if !schema.fields.is_empty() {
        let unknown: Vec<String> = fields
            .keys()
            .filter(|name| !schema.fields.contains_key(*name) && !schema.required.contains(*name))
            .cloned()
            .collect();
        for name in unknown {
            if schema.strict {
                fields.remove(&name);
                warnings.push(format!("dropped unknown field: {}", name));
            } else {
                warnings.push(format!("unknown field: {}", name));
            }
        }
    }

    (warnings, errors)
}

fn matches_type(kind: FieldType, value: &Value) -> bool {
    match kind {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Array => value.is_array(),
        FieldType::Object => value.is_object(),
        FieldType::Date => value.as_str().map_or(false, |s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(s).is_ok()
        }),
    }
}

/// Apply the schema's normalization rules. Returns whether anything changed.
fn normalize(schema: &FieldSchema, fields: &mut Map<String, Value>) -> bool {
    let mut changed = false;
    for (name, rule) in &schema.normalize {
        let Some(value) = fields.get_mut(name) else { continue };
        let normalized = match (rule, &*value) {
            (Normalization::Trim, Value::String(s)) => Value::String(s.trim().to_string()),
            (Normalization::Lowercase, Value::String(s)) => Value::String(s.trim().to_lowercase()),
            (Normalization::Uppercase, Value::String(s)) => Value::String(s.trim().to_uppercase()),
            (Normalization::Numeric, Value::String(s)) => match leading_number(s) {
                Some(number) => Value::Number(number),
                None => continue,
            },
            _ => continue,
        };
        if *value != normalized {
            *value = normalized;
            changed = true;
        }
    }
    changed
}

/// The number at the start of strings like `"12.5 kg"` or `"1,200"`.
fn leading_number(text: &str) -> Option<Number> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| *c != ',')
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(integer) = cleaned.parse::<i64>() {
        return Some(Number::from(integer));
    }
    cleaned.parse::<f64>().ok().and_then(Number::from_f64)
}
