//! Backend clients: one network-accessible OCR/VLM provider each.
//!
//! Every provider implements [`BackendClient`]: one `convert` call issues one
//! request and either returns the page text or a [`BackendError`] carrying an
//! [`crate::error::ErrorClass`]. Retrying and failing over are *not* the
//! client's job; [`crate::fallback::FallbackChain`] drives both.
//!
//! ## Variants
//!
//! | [`ProviderKind`] | Type | Wire protocol |
//! |------------------|------|---------------|
//! | `openai`    | [`openai::OpenAiBackend`]       | `/chat/completions` with an `image_url` data URI |
//! | `anthropic` | [`anthropic::AnthropicBackend`] | `/v1/messages` with a base64 image block |
//! | `edgequake` | [`llm::LlmProviderBackend`]     | whatever the `edgequake-llm` provider speaks |
//!
//! ## Connection reuse
//!
//! HTTP backends build their `reqwest::Client` (and with it the connection
//! pool) once, in the constructor, and share it across every in-flight page.
//! [`BackendClient::shutdown`] closes the backend for further calls; the pool
//! itself is released when the last `Arc` to the backend drops.

pub mod anthropic;
pub mod http;
pub mod llm;
pub mod openai;

use crate::config::{BackendConfig, ProviderKind};
use crate::error::{BackendError, PipelineError};
use crate::unit::ConversionUnit;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Text extracted from one page by one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOutput {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl BackendOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// The conversion contract every provider implements.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Registry name, used in logs, results and fallback order.
    fn name(&self) -> &str;

    /// Convert one unit with exactly one provider request.
    async fn convert(&self, unit: &ConversionUnit) -> Result<BackendOutput, BackendError>;

    /// Stop accepting requests. Calls after shutdown fail with
    /// [`crate::error::ErrorClass::Connection`].
    async fn shutdown(&self) {}
}

/// Construct the client for one backend config.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn BackendClient>, PipelineError> {
    config.validate()?;
    let backend: Arc<dyn BackendClient> = match config.provider {
        ProviderKind::OpenAi => Arc::new(openai::OpenAiBackend::from_config(config)?),
        ProviderKind::Anthropic => Arc::new(anthropic::AnthropicBackend::from_config(config)?),
        ProviderKind::Edgequake => Arc::new(llm::LlmProviderBackend::from_config(config)?),
    };
    debug!(
        backend = config.name.as_str(),
        provider = %config.provider,
        model = config.model_or_default(),
        "backend constructed"
    );
    Ok(backend)
}

/// Explicit name → backend map, built once at startup.
///
/// Passed by reference into [`crate::fallback::FallbackChain::from_config`];
/// there is no process-wide registry.
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn BackendClient>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured backend. Fails on the first invalid or
    /// duplicate entry, before any network traffic.
    pub fn from_configs(configs: &[BackendConfig]) -> Result<Self, PipelineError> {
        let mut registry = Self::new();
        for config in configs {
            if registry.backends.contains_key(&config.name) {
                return Err(PipelineError::DuplicateBackend {
                    name: config.name.clone(),
                });
            }
            registry.register(build_backend(config)?)?;
        }
        info!("Backend registry ready: {}", registry.names().join(", "));
        Ok(registry)
    }

    /// Add a pre-built backend under its own name.
    pub fn register(&mut self, backend: Arc<dyn BackendClient>) -> Result<(), PipelineError> {
        let name = backend.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(PipelineError::DuplicateBackend { name });
        }
        self.backends.insert(name, backend);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackendClient>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Shut every backend down.
    pub async fn shutdown(&self) {
        for backend in self.backends.values() {
            backend.shutdown().await;
        }
    }
}
