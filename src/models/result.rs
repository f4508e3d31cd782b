//! Agent result variants
//!
//! Each workflow engine produces exactly one of the five result shapes below.
//! On the wire they form an internally tagged union keyed by `result_type`:
//!
//! ```text
//! { "result_type": "explorer", "diagnosis": "...", "confidence": 0.82, ... }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A probability-like score bounded to `[0, 1]`.
///
/// Construction and deserialization both reject NaN and out-of-range values,
/// so a `Confidence` held anywhere in the crate is always valid.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

#[derive(Debug, Clone, PartialEq, Error)]
#[error("confidence {0} is outside [0, 1]")]
pub struct ConfidenceOutOfRange(pub f64);

impl Confidence {
    pub const ZERO: Confidence = Confidence(0.0);
    pub const ONE: Confidence = Confidence(1.0);

    pub fn new(value: f64) -> Result<Self, ConfidenceOutOfRange> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            Err(ConfidenceOutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }

    /// Clamp an arbitrary model-reported score into range. NaN becomes zero.
    pub fn saturating(value: f64) -> Self {
        if value.is_nan() {
            Self::ZERO
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Confidence {
    type Error = ConfidenceOutOfRange;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Confidence> for f64 {
    fn from(confidence: Confidence) -> Self {
        confidence.0
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Lenient parse used on LLM output; unknown labels map to `None`.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" | "minor" => Some(Severity::Low),
            "medium" | "moderate" => Some(Severity::Medium),
            "high" | "severe" => Some(Severity::High),
            "critical" | "urgent" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Output mode of the generator workflow. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    Markdown,
    Text,
    Sms,
    VoiceScript,
}

impl OutputFormat {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "json" | "structured" => Some(OutputFormat::Json),
            "markdown" | "md" => Some(OutputFormat::Markdown),
            "text" | "plain" => Some(OutputFormat::Text),
            "sms" | "short" => Some(OutputFormat::Sms),
            "voice_script" | "voice" | "spoken" => Some(OutputFormat::VoiceScript),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Markdown => "markdown",
            OutputFormat::Text => "text",
            OutputFormat::Sms => "sms",
            OutputFormat::VoiceScript => "voice_script",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisionTier {
    Screen,
    Diagnose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorResult {
    pub extracted_fields: Map<String, Value>,
    #[serde(default)]
    pub validation_warnings: Vec<String>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub normalization_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorerResult {
    pub diagnosis: String,
    pub confidence: Confidence,
    pub severity: Severity,
    #[serde(default)]
    pub contributing_factors: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub rag_sources_used: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorResult {
    pub content: String,
    pub format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<String>,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationalResult {
    pub response_text: String,
    pub detected_intent: String,
    pub intent_confidence: Confidence,
    pub session_id: String,
    pub turn_number: u32,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TieredVisionResult {
    pub classification: String,
    pub classification_confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    pub tier_used: VisionTier,
    pub cost_saved: bool,
}

/// Tagged union of all workflow results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result_type", rename_all = "snake_case")]
pub enum AgentResult {
    Extractor(ExtractorResult),
    Explorer(ExplorerResult),
    Generator(GeneratorResult),
    Conversational(ConversationalResult),
    TieredVision(TieredVisionResult),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResultInvariantError {
    #[error("tiered vision diagnosis is only allowed when tier_used=diagnose")]
    DiagnosisWithoutEscalation,
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
}

impl AgentResult {
    pub fn result_type(&self) -> &'static str {
        match self {
            AgentResult::Extractor(_) => "extractor",
            AgentResult::Explorer(_) => "explorer",
            AgentResult::Generator(_) => "generator",
            AgentResult::Conversational(_) => "conversational",
            AgentResult::TieredVision(_) => "tiered_vision",
        }
    }

    /// Check the cross-field invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ResultInvariantError> {
        match self {
            AgentResult::TieredVision(result) => {
                if result.diagnosis.is_some() && result.tier_used != VisionTier::Diagnose {
                    return Err(ResultInvariantError::DiagnosisWithoutEscalation);
                }
                if result.classification.trim().is_empty() {
                    return Err(ResultInvariantError::EmptyField("classification"));
                }
                Ok(())
            }
            AgentResult::Explorer(result) if result.diagnosis.trim().is_empty() => {
                Err(ResultInvariantError::EmptyField("diagnosis"))
            }
            AgentResult::Conversational(result) if result.session_id.is_empty() => {
                Err(ResultInvariantError::EmptyField("session_id"))
            }
            _ => Ok(()),
        }
    }
}
