//! Anthropic Messages API backend.

use super::http::{self, EncodedImage};
use super::{BackendClient, BackendOutput};
use crate::config::BackendConfig;
use crate::error::{BackendError, PipelineError};
use crate::prompts::instruction_or_default;
use crate::unit::ConversionUnit;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    name: String,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
    instruction: String,
    client: reqwest::Client,
    closed: AtomicBool,
}

impl AnthropicBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, PipelineError> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| PipelineError::MissingCredentials {
                backend: config.name.clone(),
                hint: "Set ANTHROPIC_API_KEY or 'api_key_env' for this backend.".into(),
            })?;
        let base = config.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        Ok(Self {
            name: config.name.clone(),
            url: format!("{}/v1/messages", base.trim_end_matches('/')),
            api_key,
            model: config.model_or_default().to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            instruction: instruction_or_default(config.instruction.as_deref()).to_string(),
            client: http::build_client(&config.name)?,
            closed: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_body(&self, image: &EncodedImage) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": { "type": "base64", "media_type": image.mime, "data": image.data }
                    },
                    { "type": "text", "text": self.instruction }
                ]
            }]
        })
    }
}

/// Join the text blocks of a Messages API reply.
pub(crate) fn parse_response(body: &Value) -> Result<BackendOutput, BackendError> {
    let content = http::normalize_content(&body["content"])
        .ok_or_else(|| BackendError::malformed("response carries no text blocks"))?;
    let usage = &body["usage"];
    Ok(BackendOutput {
        content,
        input_tokens: http::usage_count(usage, "input_tokens"),
        output_tokens: http::usage_count(usage, "output_tokens"),
    })
}

#[async_trait]
impl BackendClient for AnthropicBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn convert(&self, unit: &ConversionUnit) -> Result<BackendOutput, BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::connection(format!(
                "backend '{}' has been shut down",
                self.name
            )));
        }
        let image = EncodedImage::encode(unit.payload());
        let request = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(&image));
        debug!(backend = self.name.as_str(), page = unit.page_num(), "POST {}", self.url);
        let body = http::send_json(request).await?;
        parse_response(&body)
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::error::ErrorClass;

    fn backend() -> AnthropicBackend {
        let cfg = BackendConfig::new("claude", ProviderKind::Anthropic).with_api_key("sk-ant-test");
        AnthropicBackend::from_config(&cfg).expect("valid backend")
    }

    #[test]
    fn default_url() {
        assert_eq!(backend().url(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn key_is_required() {
        let cfg = BackendConfig {
            api_key_env: Some("EDGEQUAKE_OCR_TEST_UNSET_KEY".into()),
            ..BackendConfig::new("claude", ProviderKind::Anthropic)
        };
        assert!(matches!(
            AnthropicBackend::from_config(&cfg),
            Err(PipelineError::MissingCredentials { .. })
        ));
    }

    #[test]
    fn body_uses_base64_image_block() {
        let body = backend().request_body(&EncodedImage::encode(&[0xFF, 0xD8, 0xFF, 0xE0]));
        let block = &body["messages"][0]["content"][0];
        assert_eq!(block["type"], "image");
        assert_eq!(block["source"]["media_type"], "image/jpeg");
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
    }

    #[test]
    fn parses_text_blocks_and_usage() {
        let body = json!({
            "content": [{ "type": "text", "text": "Line one" }, { "type": "text", "text": "\nLine two" }],
            "usage": { "input_tokens": 1500, "output_tokens": 12 }
        });
        let out = parse_response(&body).unwrap();
        assert_eq!(out.content, "Line one\nLine two");
        assert_eq!(out.input_tokens, 1500);
        assert_eq!(out.output_tokens, 12);
    }

    #[test]
    fn missing_content_is_malformed() {
        let err = parse_response(&json!({ "type": "message" })).unwrap_err();
        assert_eq!(err.class, ErrorClass::MalformedResponse);
    }
}
