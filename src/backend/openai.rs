//! OpenAI-compatible `/chat/completions` backend.
//!
//! Works against api.openai.com and any server that speaks the same
//! protocol with vision input (vLLM, LM Studio, OpenRouter, Ollama `/v1`).
//! The page goes in as an `image_url` data URI, the instruction as text.

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

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";

pub struct OpenAiBackend {
    name: String,
    url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: usize,
    instruction: String,
    client: reqwest::Client,
    closed: AtomicBool,
}

impl OpenAiBackend {
    /// Build from config. The public endpoint requires a key; a custom
    /// endpoint may run without one (local servers usually do).
    pub fn from_config(config: &BackendConfig) -> Result<Self, PipelineError> {
        let api_key = config.resolve_api_key();
        if config.endpoint.is_none() && api_key.is_none() {
            return Err(PipelineError::MissingCredentials {
                backend: config.name.clone(),
                hint: "Set OPENAI_API_KEY, 'api_key_env', or point 'endpoint' at a local server."
                    .into(),
            });
        }
        let base = config.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        Ok(Self {
            name: config.name.clone(),
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
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
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": self.instruction },
                    { "type": "image_url", "image_url": { "url": image.data_uri(), "detail": "high" } }
                ]
            }]
        })
    }
}

/// Extract the page text and usage from a chat-completions body.
pub(crate) fn parse_response(body: &Value) -> Result<BackendOutput, BackendError> {
    let message = body["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .ok_or_else(|| BackendError::malformed("response has no choices"))?;
    let content = http::normalize_content(&message["content"])
        .ok_or_else(|| BackendError::malformed("first choice carries no text content"))?;
    let usage = &body["usage"];
    Ok(BackendOutput {
        content,
        input_tokens: http::usage_count(usage, "prompt_tokens"),
        output_tokens: http::usage_count(usage, "completion_tokens"),
    })
}

#[async_trait]
impl BackendClient for OpenAiBackend {
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
        let mut request = self.client.post(&self.url).json(&self.request_body(&image));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        debug!(backend = self.name.as_str(), page = unit.page_num(), "POST {}", self.url);
        let body = http::send_json(request).await?;
        parse_response(&body)
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        debug!(backend = self.name.as_str(), "backend shut down");
    }
}
