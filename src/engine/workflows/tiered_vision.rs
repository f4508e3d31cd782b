//! Tiered vision: fetch context → screen → (diagnose) → emit.
//!
//! Every image is screened by the cheap model first. Only when the screen's
//! confidence falls below `escalation_threshold` is the costlier diagnosis
//! model called; its answer then replaces the screen's.

use serde_json::Value;
use tracing::{debug, info};

use super::{
    call_llm, fetch_context, step_prompt, WorkflowContext, WorkflowFailure,
    WorkflowOutput, WorkflowResult,
};
use crate::llm::ImageInput;
use crate::models::{
    AgentResult, Confidence, ErrorType, TieredVisionResult, TieredVisionSettings, VisionTier,
};

enum Step {
    FetchContext,
    Screen,
    Diagnose,
    Emit,
}

#[derive(Default)]
struct VisionState {
    context: Value,
    classification: String,
    confidence: f64,
    diagnosis: Option<String>,
    escalated: bool,
}

pub struct TieredVisionWorkflow<'a> {
    settings: &'a TieredVisionSettings,
}

impl<'a> TieredVisionWorkflow<'a> {
    pub fn new(settings: &'a TieredVisionSettings) -> Self {
        Self { settings }
    }

    pub async fn run(&self, ctx: &WorkflowContext) -> WorkflowResult {
        let image = image_input(&ctx.request.input_data)
            .ok_or_else(|| WorkflowFailure::new(ErrorType::Validation, "request carries no image"))?;

        let mut state = VisionState::default();
        let mut step = Step::FetchContext;

        loop {
            step = match step {
                Step::FetchContext => {
                    state.context = fetch_context(ctx).await?;
                    Step::Screen
                }
                Step::Screen => {
                    let json = self
                        .ask(
                            ctx,
                            &state.context,
                            &self.settings.screen_model,
                            &image,
                            "Task: screen\nClassify the image. Return JSON: \
                             {\"classification\": \"...\", \"confidence\": 0.0-1.0}",
                        )
                        .await?;
                    state.classification = classification(&json)
                        .ok_or_else(|| WorkflowFailure::new(ErrorType::LlmError, "screen returned no classification"))?;
                    state.confidence = Confidence::saturating(json.get("confidence").and_then(Value::as_f64).unwrap_or(0.0)).value();

                    if state.confidence < self.settings.escalation_threshold {
                        debug!(
                            request_id = %ctx.request.request_id,
                            confidence = state.confidence,
                            threshold = self.settings.escalation_threshold,
                            "escalating to diagnosis"
                        );
                        Step::Diagnose
                    } else {
                        Step::Emit
                    }
                }
                Step::Diagnose => {
                    let instructions = format!(
                        "Task: diagnose\nThe screening model suggested \"{}\" with confidence {:.2}. \
                         Examine the image closely. Return JSON: {{\"classification\": \"...\", \
                         \"diagnosis\": \"...\", \"confidence\": 0.0-1.0}}",
                        state.classification, state.confidence
                    );
                    let json = self
                        .ask(ctx, &state.context, &self.settings.diagnose_model, &image, &instructions)
                        .await?;
                    if let Some(classification) = classification(&json) {
                        state.classification = classification;
                    }
                    state.confidence = Confidence::saturating(json.get("confidence").and_then(Value::as_f64).unwrap_or(0.0)).value();
                    state.diagnosis = json
                        .get("diagnosis")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .map(str::to_string);
                    state.escalated = true;
                    Step::Emit
                }
                Step::Emit => {
                    let tier_used = if state.escalated { VisionTier::Diagnose } else { VisionTier::Screen };
                    info!(
                        request_id = %ctx.request.request_id,
                        tier = ?tier_used,
                        classification = %state.classification,
                        "vision complete"
                    );
                    return Ok(WorkflowOutput {
                        result: AgentResult::TieredVision(TieredVisionResult {
                            classification: std::mem::take(&mut state.classification),
                            classification_confidence: Confidence::saturating(state.confidence),
                            diagnosis: state.diagnosis.take(),
                            tier_used,
                            cost_saved: tier_used == VisionTier::Screen,
                        }),
                    });
                }
            };
        }
    }

    async fn ask(
        &self,
        ctx: &WorkflowContext,
        context: &Value,
        model: &str,
        image: &ImageInput,
        instructions: &str,
    ) -> Result<Value, WorkflowFailure> {
        let vars = ctx.base_variables(context);
        let prompt = step_prompt(ctx, &vars, instructions)?;
        let mut request = ctx.completion_request(prompt).with_image(image.clone());
        if !model.is_empty() {
            request.model = model.to_string();
        }
        let reply = call_llm(ctx, &request, true).await?;
        Ok(reply.json.unwrap_or(Value::Null))
    }
}

fn classification(json: &Value) -> Option<String> {
    json.get("classification")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

/// `input_data.image {media_type, data}` or flat `image_base64` + `media_type`.
fn image_input(input: &Value) -> Option<ImageInput> {
    let (data, media_type) = match input.get("image") {
        Some(image) => (image.get("data")?, image.get("media_type")),
        None => (input.get("image_base64")?, input.get("media_type")),
    };
    let data = data.as_str().filter(|d| !d.is_empty())?;
    Some(ImageInput {
        media_type: media_type.and_then(Value::as_str).unwrap_or("image/jpeg").to_string(),
        data: data.to_string(),
    })
}
