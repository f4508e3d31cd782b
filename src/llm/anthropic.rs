//! Anthropic Messages API gateway.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{Completion, CompletionRequest, CostAnalyzer, LLMError, LLMResult, LlmGateway};
use crate::config::GatewayConfig;

pub struct AnthropicGateway {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    anthropic_version: String,
    costs: CostAnalyzer,
}

impl AnthropicGateway {
    pub fn new(api_key: impl Into<String>, config: &GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            anthropic_version: config.anthropic_version.clone(),
            costs: CostAnalyzer::new(),
        }
    }

    /// Read the API key from the env var the config names.
    pub fn from_env(config: &GatewayConfig) -> LLMResult<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            LLMError::AuthenticationFailed(format!("{} is not set", config.api_key_env))
        })?;
        Ok(Self::new(api_key, config))
    }

    fn request_body(request: &CompletionRequest) -> Value {
        let content = if request.images.is_empty() {
            json!(request.prompt)
        } else {
            let mut blocks: Vec<Value> = request
                .images
                .iter()
                .map(|image| {
                    json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": image.media_type,
                            "data": image.data
                        }
                    })
                })
                .collect();
            blocks.push(json!({"type": "text", "text": request.prompt}));
            Value::Array(blocks)
        };

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{
                "role": "user",
                "content": content
            }]
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        body
    }
}

#[async_trait]
impl LlmGateway for AnthropicGateway {
    async fn complete(&self, request: &CompletionRequest) -> LLMResult<Completion> {
        let messages_url = format!("{}/messages", self.base_url);
        debug!(model = %request.model, "calling Anthropic messages API");

        let response = self
            .client
            .post(&messages_url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.anthropic_version)
            .json(&Self::request_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LLMError::Timeout(e.to_string())
                } else {
                    LLMError::Network(format!("Anthropic API request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = format!("Anthropic API error {}: {}", status, error_text);
            return Err(match status.as_u16() {
                401 | 403 => LLMError::AuthenticationFailed(message),
                429 => LLMError::RateLimitExceeded(message),
                500..=599 => LLMError::ProviderUnhealthy(message),
                _ => LLMError::InvalidRequest(message),
            });
        }

        let response_json: Value = response.json().await.map_err(|e| {
            LLMError::Serialization(format!("Failed to parse Anthropic response: {}", e))
        })?;

        parse_response(&response_json, &request.model, &self.costs)
    }
}

fn parse_response(body: &Value, requested_model: &str, costs: &CostAnalyzer) -> LLMResult<Completion> {
    let text: String = body
        .get("content")
        .and_then(|content| content.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .ok_or_else(|| LLMError::Serialization("response has no content blocks".to_string()))?;

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(requested_model)
        .to_string();
    let usage = body.get("usage");
    let tokens_in = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let tokens_out = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(Completion {
        cost_usd: costs.estimate(&model, tokens_in, tokens_out),
        text,
        model,
        tokens_in,
        tokens_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ImageInput;

    #[test]
    fn test_parse_response_joins_text_blocks() {
        let body = json!({
            "model": "claude-3-haiku-20240307",
            "content": [
                {"type": "text", "text": "{\"grade\":"},
                {"type": "text", "text": "\"A\"}"}
            ],
            "usage": {"input_tokens": 120, "output_tokens": 8}
        });
        let completion = parse_response(&body, "ignored", &CostAnalyzer::new()).unwrap();
        assert_eq!(completion.text, "{\"grade\":\"A\"}");
        assert_eq!(completion.tokens_in, 120);
        assert!(completion.cost_usd > 0.0);
    }

    #[test]
    fn test_parse_response_without_content_fails() {
        let body = json!({"type": "error"});
        assert!(matches!(
            parse_response(&body, "m", &CostAnalyzer::new()),
            Err(LLMError::Serialization(_))
        ));
    }

    #[test]
    fn test_request_body_places_images_before_text() {
        let request = CompletionRequest::new("claude-3-haiku-20240307", "classify this leaf")
            .with_system("you are an agronomist")
            .with_image(ImageInput {
                media_type: "image/jpeg".to_string(),
                data: "aGVsbG8=".to_string(),
            });
        let body = AnthropicGateway::request_body(&request);
        assert_eq!(body["system"], json!("you are an agronomist"));
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], json!("image"));
        assert_eq!(content[1]["text"], json!("classify this leaf"));
    }
}
