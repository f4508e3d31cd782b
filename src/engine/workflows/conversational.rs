//! Conversational: fetch context → respond → emit.
//!
//! One turn per request. The caller owns the session: it passes the
//! `session_id` and recent `history` back in on every turn, and keeps turn
//! numbers monotonic.

use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    call_llm, fetch_context, step_prompt, string_list, WorkflowContext,
    WorkflowFailure, WorkflowOutput, WorkflowResult,
};
use crate::models::{
    AgentResult, Confidence, ConversationalResult, ConversationalSettings, ErrorType,
};

enum Step {
    FetchContext,
    Respond,
    Emit,
}

#[derive(Default)]
struct TurnState {
    context: Value,
    result: Option<ConversationalResult>,
}

pub struct ConversationalWorkflow<'a> {
    settings: &'a ConversationalSettings,
}

impl<'a> ConversationalWorkflow<'a> {
    pub fn new(settings: &'a ConversationalSettings) -> Self {
        Self { settings }
    }

    pub async fn run(&self, ctx: &WorkflowContext) -> WorkflowResult {
        let input = &ctx.request.input_data;
        let message = input
            .get("message")
            .or_else(|| input.get("text"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if message.is_empty() {
            return Err(WorkflowFailure::new(ErrorType::Validation, "no message to respond to"));
        }

        let history = input
            .get("history")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let session_id = input
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let turn_number = match input.get("turn_number").and_then(Value::as_u64) {
            Some(turn) => u32::try_from(turn).map_err(|_| {
                WorkflowFailure::new(ErrorType::Validation, format!("turn_number {} is out of range", turn))
            })?,
            None => u32::try_from(history.len()).map_or(u32::MAX, |len| len.saturating_add(1)),
        };
        let recent = &history[history.len().saturating_sub(self.settings.max_history_turns)..];

        let mut state = TurnState::default();
        let mut step = Step::FetchContext;

        loop {
            step = match step {
                Step::FetchContext => {
                    state.context = fetch_context(ctx).await?;
                    Step::Respond
                }
                Step::Respond => {
                    let mut vars = ctx.base_variables(&state.context);
                    vars.insert("message".to_string(), json!(message));
                    vars.insert("history".to_string(), json!(recent));
                    vars.insert("session_id".to_string(), json!(session_id));
                    vars.insert("turn_number".to_string(), json!(turn_number));
                    let prompt = step_prompt(ctx, &vars, &self.instructions(&message, recent))?;
                    let reply = call_llm(ctx, &ctx.completion_request(prompt), true).await?;
                    let json = reply.json.unwrap_or(Value::Null);

                    let response_text = json
                        .get("response")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .unwrap_or_default()
                        .to_string();
                    if response_text.is_empty() {
                        return Err(WorkflowFailure::new(ErrorType::LlmError, "reply has no response text"));
                    }

                    let intent = json.get("intent").and_then(Value::as_str).unwrap_or_default();
                    state.result = Some(ConversationalResult {
                        response_text,
                        detected_intent: self.resolve_intent(intent),
                        intent_confidence: Confidence::saturating(
                            json.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
                        ),
                        session_id: session_id.clone(),
                        turn_number,
                        suggested_actions: string_list(json.get("suggested_actions")),
                    });
                    Step::Emit
                }
                Step::Emit => {
                    let Some(result) = state.result.take() else {
                        return Err(WorkflowFailure::new(ErrorType::LlmError, "nothing to emit"));
                    };
                    info!(
                        request_id = %ctx.request.request_id,
                        session_id = %result.session_id,
                        turn = result.turn_number,
                        intent = %result.detected_intent,
                        "turn complete"
                    );
                    return Ok(WorkflowOutput {
                        result: AgentResult::Conversational(result),
                    });
                }
            };
        }
    }

    fn instructions(&self, message: &str, history: &[Value]) -> String {
        let mut text = String::from("Task: respond\n");
        if !history.is_empty() {
            text.push_str("Conversation so far:\n");
            for turn in history {
                let role = turn.get("role").and_then(Value::as_str).unwrap_or("user");
                let content = turn.get("content").and_then(Value::as_str).unwrap_or_default();
                text.push_str(&format!("{}: {}\n", role, content));
            }
        }
        text.push_str(&format!("User: {}\n", message));
        if !self.settings.intents.is_empty() {
            text.push_str(&format!("Known intents: {}.\n", self.settings.intents.join(", ")));
        }
        text.push_str(
            "Return JSON: {\"response\": \"...\", \"intent\": \"...\", \"confidence\": 0.0-1.0, \
             \"suggested_actions\": [...]}",
        );
        text
    }

    /// Unknown intents fall back when a closed intent list is configured.
    fn resolve_intent(&self, intent: &str) -> String {
        let intent = intent.trim().to_lowercase();
        let known = self.settings.intents.is_empty() || self.settings.intents.iter().any(|i| i.eq_ignore_ascii_case(&intent));
        if intent.is_empty() || !known {
            debug!(intent = %intent, fallback = %self.settings.fallback_intent, "intent not recognized");
            return self.settings.fallback_intent.clone();
        }
        intent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{context_for, Reply, ScriptedLlm};
    use crate::models::WorkflowSettings;
    use std::sync::Arc;

    fn settings() -> ConversationalSettings {
        ConversationalSettings {
            intents: vec!["payment_query".to_string(), "quality_query".to_string()],
            max_history_turns: 2,
            ..ConversationalSettings::default()
        }
    }

    fn reply(intent: &str) -> Reply {
        Reply::text(&format!(
            r#"{{"response": "Your payment is on Friday.", "intent": "{}", "confidence": 1.4, "suggested_actions": ["check_statement"]}}"#,
            intent
        ))
    }

    #[tokio::test]
    async fn test_turn_number_and_session_from_input() {
        let llm = Arc::new(ScriptedLlm::new().when("Task: respond", reply("payment_query")));
        let input = json!({
            "message": "When do I get paid?",
            "session_id": "sess-9",
            "history": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "second"},
                {"role": "user", "content": "third"}
            ]
        });
        let ctx = context_for(WorkflowSettings::Conversational(settings()), llm.clone(), input);

        let output = ConversationalWorkflow::new(&settings()).run(&ctx).await.unwrap();
        let AgentResult::Conversational(result) = output.result else {
            panic!("expected conversational result");
        };
        assert_eq!(result.session_id, "sess-9");
        assert_eq!(result.turn_number, 4);
        assert_eq!(result.detected_intent, "payment_query");
        assert_eq!(result.intent_confidence, Confidence::ONE);
        assert_eq!(result.suggested_actions, vec!["check_statement".to_string()]);

        // only the last two turns are replayed
        let prompt = &llm.calls()[0].prompt;
        assert!(!prompt.contains("user: first"));
        assert!(prompt.contains("assistant: second"));
    }

    #[tokio::test]
    async fn test_unknown_intent_falls_back_and_session_generated() {
        let llm = Arc::new(ScriptedLlm::new().when("Task: respond", reply("weather_chat")));
        let ctx = context_for(
            WorkflowSettings::Conversational(settings()),
            llm,
            json!({"text": "Will it rain?"}),
        );

        let output = ConversationalWorkflow::new(&settings()).run(&ctx).await.unwrap();
        let AgentResult::Conversational(result) = output.result else {
            panic!("expected conversational result");
        };
        assert_eq!(result.detected_intent, "unknown");
        assert_eq!(result.turn_number, 1);
        assert!(Uuid::parse_str(&result.session_id).is_ok());
    }

    #[tokio::test]
    async fn test_missing_message_is_validation_failure() {
        let llm = Arc::new(ScriptedLlm::new());
        let ctx = context_for(WorkflowSettings::Conversational(settings()), llm, json!({}));
        let failure = ConversationalWorkflow::new(&settings()).run(&ctx).await.unwrap_err();
        assert_eq!(failure.error_type, ErrorType::Validation);
    }

    #[tokio::test]
    async fn test_oversized_turn_number_is_validation_failure() {
        let llm = Arc::new(ScriptedLlm::new().when("Task: respond", reply("payment_query")));
        let input = json!({"message": "When do I get paid?", "turn_number": 5_000_000_000u64});
        let ctx = context_for(WorkflowSettings::Conversational(settings()), llm.clone(), input);

        let failure = ConversationalWorkflow::new(&settings()).run(&ctx).await.unwrap_err();
        assert_eq!(failure.error_type, ErrorType::Validation);
        assert!(failure.message.contains("5000000000"));
        assert!(llm.calls().is_empty());
    }
}
