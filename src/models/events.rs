//! Inbound request and outbound result envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::linkage::{EntityLinkage, LinkageError};
use super::result::AgentResult;

/// Inbound work item. Created by an external producer and never mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequestEvent {
    pub request_id: String,
    pub agent_id: String,
    pub linkage: EntityLinkage,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "unknown".to_string()
}

/// Reasons an inbound payload cannot become an [`AgentRequestEvent`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("payload does not match the request schema: {0}")]
    Schema(#[source] serde_json::Error),
    #[error("field {0} must not be empty")]
    EmptyField(&'static str),
    #[error(transparent)]
    Linkage(#[from] LinkageError),
}

/// Keys under which a generic event envelope may nest the actual request.
const WRAPPER_KEYS: [&str; 2] = ["payload", "data"];

impl AgentRequestEvent {
    pub fn new(
        request_id: impl Into<String>,
        agent_id: impl Into<String>,
        linkage: EntityLinkage,
        input_data: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            agent_id: agent_id.into(),
            linkage,
            input_data,
            context: None,
            source: default_source(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Decode and validate a raw bus payload.
    ///
    /// A single level of generic wrapping (`{"payload": {...}}` or
    /// `{"data": {...}}`) is unwrapped when the top level does not look like a
    /// request itself. Deeper nesting is treated as a schema violation.
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(payload).map_err(EnvelopeError::Malformed)?;
        let value = unwrap_envelope(value);
        let request: AgentRequestEvent =
            serde_json::from_value(value).map_err(EnvelopeError::Schema)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.request_id.trim().is_empty() {
            return Err(EnvelopeError::EmptyField("request_id"));
        }
        if self.agent_id.trim().is_empty() {
            return Err(EnvelopeError::EmptyField("agent_id"));
        }
        self.linkage.validate()?;
        Ok(())
    }
}

fn unwrap_envelope(value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };
    if map.contains_key("agent_id") || map.contains_key("request_id") {
        return Value::Object(map);
    }
    for key in WRAPPER_KEYS {
        if matches!(map.get(key), Some(Value::Object(_))) {
            if let Some(inner) = map.remove(key) {
                return inner;
            }
        }
    }
    Value::Object(map)
}

/// Published once when a workflow reaches `completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCompletedEvent {
    pub request_id: String,
    pub agent_id: String,
    pub linkage: EntityLinkage,
    pub result: AgentResult,
    pub execution_time_ms: u64,
    pub model_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub completed_at: DateTime<Utc>,
}

/// Well-known business failure categories. The taxonomy is open, so
/// anything else travels as [`ErrorType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Validation,
    LlmError,
    Timeout,
    ConfigNotFound,
    PromptNotFound,
    AnalysisFailed,
    ContextUnavailable,
    Other(String),
}

impl ErrorType {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorType::Validation => "validation",
            ErrorType::LlmError => "llm_error",
            ErrorType::Timeout => "timeout",
            ErrorType::ConfigNotFound => "config_not_found",
            ErrorType::PromptNotFound => "prompt_not_found",
            ErrorType::AnalysisFailed => "analysis_failed",
            ErrorType::ContextUnavailable => "context_unavailable",
            ErrorType::Other(other) => other,
        }
    }
}

impl From<&str> for ErrorType {
    fn from(label: &str) -> Self {
        match label {
            "validation" => ErrorType::Validation,
            "llm_error" => ErrorType::LlmError,
            "timeout" => ErrorType::Timeout,
            "config_not_found" => ErrorType::ConfigNotFound,
            "prompt_not_found" => ErrorType::PromptNotFound,
            "analysis_failed" => ErrorType::AnalysisFailed,
            "context_unavailable" => ErrorType::ContextUnavailable,
            other => ErrorType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(ErrorType::from(label.as_str()))
    }
}

/// Business-level failure, distinct from transport redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFailedEvent {
    pub request_id: String,
    pub agent_id: String,
    pub linkage: EntityLinkage,
    pub error_type: ErrorType,
    pub error_message: String,
    #[serde(default)]
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

/// Side-channel cost telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecordedEvent {
    pub request_id: String,
    pub agent_id: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_json() -> Value {
        json!({
            "request_id": "req-1",
            "agent_id": "qc-event-extractor",
            "linkage": {"farmer_id": "WM-0001"},
            "input_data": {"text": "grade A"},
            "source": "collection-app"
        })
    }

    #[test]
    fn test_decode_plain_request() {
        let bytes = serde_json::to_vec(&request_json()).unwrap();
        let request = AgentRequestEvent::decode(&bytes).unwrap();
        assert_eq!(request.agent_id, "qc-event-extractor");
        assert_eq!(request.source, "collection-app");
        assert_eq!(request.linkage.farmer_id.as_deref(), Some("WM-0001"));
    }

    #[test]
    fn test_decode_unwraps_one_level() {
        for key in ["payload", "data"] {
            let wrapped = json!({"event_type": "ai.agent.requested", key: request_json()});
            let bytes = serde_json::to_vec(&wrapped).unwrap();
            let request = AgentRequestEvent::decode(&bytes).unwrap();
            assert_eq!(request.request_id, "req-1");
        }
    }

    #[test]
    fn test_decode_does_not_unwrap_twice() {
        let wrapped = json!({"payload": {"payload": request_json()}});
        let bytes = serde_json::to_vec(&wrapped).unwrap();
        assert!(matches!(
            AgentRequestEvent::decode(&bytes),
            Err(EnvelopeError::Schema(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_agent_id() {
        let mut value = request_json();
        value.as_object_mut().unwrap().remove("agent_id");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            AgentRequestEvent::decode(&bytes),
            Err(EnvelopeError::Schema(_))
        ));
    }

    #[test]
    fn test_decode_rejects_invalid_linkage_and_garbage() {
        let mut value = request_json();
        value["linkage"] = json!({"farmer_id": ""});
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            AgentRequestEvent::decode(&bytes),
            Err(EnvelopeError::Linkage(_))
        ));

        assert!(matches!(
            AgentRequestEvent::decode(b"not json"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_error_type_is_open() {
        let failed: ErrorType = serde_json::from_value(json!("quota_exhausted")).unwrap();
        assert_eq!(failed, ErrorType::Other("quota_exhausted".to_string()));
        assert_eq!(serde_json::to_value(ErrorType::ConfigNotFound).unwrap(), json!("config_not_found"));
    }
}
