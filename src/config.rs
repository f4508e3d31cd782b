//! Service configuration.
//!
//! Layered with the `config` crate, lowest precedence first:
//!
//! 1. built-in defaults ([`ServiceConfig::default`])
//! 2. an optional TOML file, `ai-model.toml` unless `AI_MODEL_CONFIG` points elsewhere
//! 3. environment variables such as `AI_MODEL_NATS__URL` or `AI_MODEL_RETRY__MAX_ATTEMPTS`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::Result;

/// Env var naming an alternate config file
pub const CONFIG_PATH_ENV: &str = "AI_MODEL_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "ai-model.toml";
const ENV_PREFIX: &str = "AI_MODEL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub nats: NatsConfig,
    pub retry: RetryPolicy,
    pub dispatch: DispatchConfig,
    pub dead_letter: DeadLetterConfig,
    pub llm: GatewayConfig,
    pub catalog: CatalogConfig,
}

impl ServiceConfig {
    /// Load from defaults, the config file and the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Some(PathBuf::from(path)))
    }

    /// Same as [`ServiceConfig::load`] with an explicit file. A missing file is
    /// fine; a malformed one is not.
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&ServiceConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }

        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    pub client_name: String,
    pub connection_timeout_secs: u64,
    pub reconnect_attempts: usize,
    /// JetStream stream capturing the request and dead-letter topics
    pub stream_name: String,
    /// Durable consumer for the request topic
    pub consumer_name: String,
    /// Durable consumer for the dead-letter topic
    pub dead_letter_consumer_name: String,
    /// How long JetStream waits for an ack before redelivering on its own
    pub ack_wait_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            client_name: "ai-model".to_string(),
            connection_timeout_secs: 10,
            reconnect_attempts: 5,
            stream_name: "AI_MODEL_EVENTS".to_string(),
            consumer_name: "ai-model-agent-requests".to_string(),
            dead_letter_consumer_name: "ai-model-dead-letters".to_string(),
            ack_wait_secs: 180,
        }
    }
}

impl NatsConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

/// Bounded exponential backoff for bus redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total deliveries including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivering after `attempt` deliveries have failed.
    /// Attempt numbering starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether `attempt` deliveries have used up the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub request_topic: String,
    /// How long a delivery thread waits on the execution context
    pub handoff_timeout_secs: u64,
    /// Upper bound on one workflow run inside the execution context
    pub workflow_timeout_secs: u64,
    /// Deliveries processed concurrently by one subscription loop
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_topic: "ai.agent.requested".to_string(),
            handoff_timeout_secs: 150,
            workflow_timeout_secs: 120,
            max_in_flight: 8,
        }
    }
}

impl DispatchConfig {
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_secs(self.handoff_timeout_secs)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterBackend {
    Memory,
    Nats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub topic: String,
    pub backend: DeadLetterBackend,
    /// KV bucket used by the NATS backend
    pub bucket: String,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            topic: "events.dlq".to_string(),
            backend: DeadLetterBackend::Nats,
            bucket: "ai-model-dead-letters".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    /// Env var the API key is read from; the key itself never lives in config
    pub api_key_env: String,
    pub anthropic_version: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            anthropic_version: "2023-06-01".to_string(),
        }
    }
}

/// Where the file-backed collaborators read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub agents_path: PathBuf,
    pub prompts_path: PathBuf,
    pub knowledge_path: Option<PathBuf>,
    pub entities_path: Option<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            agents_path: PathBuf::from("catalog/agents.json"),
            prompts_path: PathBuf::from("catalog/prompts.json"),
            knowledge_path: None,
            entities_path: None,
        }
    }
}
