//! Adapter running any `edgequake-llm` provider as a backend.
//!
//! The factory covers providers without a dedicated HTTP client here
//! (Gemini, Mistral, Ollama native, Azure, …). Its errors arrive as rendered
//! messages, so the class is recovered from the status code or the phrasing
//! they carry; see [`classify_llm_error`].

use super::http::EncodedImage;
use super::{BackendClient, BackendOutput};
use crate::config::BackendConfig;
use crate::error::{BackendError, ErrorClass, PipelineError};
use crate::prompts::instruction_or_default;
use crate::unit::ConversionUnit;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

static HTTP_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([45]\d\d)\b").unwrap());

pub struct LlmProviderBackend {
    name: String,
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
    instruction: String,
    closed: AtomicBool,
}

impl LlmProviderBackend {
    /// Wrap an already-constructed provider.
    pub fn with_provider(config: &BackendConfig, provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            name: config.name.clone(),
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            instruction: instruction_or_default(config.instruction.as_deref()).to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Ask the factory for `config.upstream` with the configured model.
    /// The factory reads the provider's own API key variable.
    pub fn from_config(config: &BackendConfig) -> Result<Self, PipelineError> {
        let upstream = config.upstream.as_deref().unwrap_or_default();
        let provider = ProviderFactory::create_llm_provider(upstream, config.model_or_default())
            .map_err(|e| PipelineError::MissingCredentials {
                backend: config.name.clone(),
                hint: format!("edgequake-llm provider '{upstream}' is not available: {e}"),
            })?;
        Ok(Self::with_provider(config, provider))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl BackendClient for LlmProviderBackend {
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
        let encoded = EncodedImage::encode(unit.payload());
        let image = ImageData::new(encoded.data, encoded.mime).with_detail("high");
        let messages = vec![
            ChatMessage::system(self.instruction.as_str()),
            ChatMessage::user_with_images("", vec![image]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options()))
            .await
            .map_err(|e| {
                let message = e.to_string();
                BackendError::new(classify_llm_error(&message), message)
            })?;

        debug!(
            "Page {}: {} input tokens, {} output tokens via '{}'",
            unit.page_num(),
            response.prompt_tokens,
            response.completion_tokens,
            self.name
        );
        Ok(BackendOutput {
            content: response.content,
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        })
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Recover an [`ErrorClass`] from a provider error message.
///
/// An embedded 4xx/5xx status wins; otherwise well-known phrases decide.
/// Anything unrecognised counts as a server-side failure and is retried.
pub fn classify_llm_error(message: &str) -> ErrorClass {
    if let Some(status) = HTTP_STATUS
        .captures(message)
        .and_then(|c| c[1].parse::<u16>().ok())
    {
        return ErrorClass::from_status(status, None);
    }

    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["rate limit", "too many requests", "quota exceeded"]) {
        ErrorClass::RateLimited { retry_after: None }
    } else if has(&["timed out", "timeout", "deadline"]) {
        ErrorClass::Timeout
    } else if has(&["connection", "connect", "dns", "network", "broken pipe"]) {
        ErrorClass::Connection
    } else if has(&["unauthorized", "api key", "authentication", "permission"]) {
        ErrorClass::ClientError { status: 401 }
    } else if has(&["model not found", "model_not_found", "does not exist"]) {
        ErrorClass::ClientError { status: 404 }
    } else if has(&["invalid request", "bad request", "unsupported image", "too large"]) {
        ErrorClass::ClientError { status: 400 }
    } else if has(&["parse", "deserializ", "unexpected response", "invalid json"]) {
        ErrorClass::MalformedResponse
    } else {
        ErrorClass::ServerError { status: 500 }
    }
}
