//! Configuration types for page-by-page OCR runs.
//!
//! Two layers:
//!
//! * [`ChainConfig`] / [`BackendConfig`] / [`RetryConfig`]: plain data,
//!   `serde`-(de)serialisable, describing *which* providers to call and how
//!   patiently. This is what a config file or the CLI's `--backends` JSON
//!   holds.
//! * [`PipelineConfig`]: the run itself: concurrency, cancellation, output
//!   assembly, progress sink. Built via [`PipelineConfigBuilder`]; holds
//!   trait objects, so it is not serialisable.
//!
//! Validation happens in [`PipelineConfigBuilder::build`] and again when the
//! backend registry is built; both return [`PipelineError`] before any page
//! is dispatched.

use crate::error::PipelineError;
use crate::progress::ProgressSink;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ── Retry ────────────────────────────────────────────────────────────────

/// Retry budget and backoff shape for one backend.
///
/// Delays double after each failed attempt starting at `base_delay_ms`
/// (500 ms → 1 s → 2 s …), capped at `max_delay_ms`. With `jitter` on, a
/// uniform random amount in `[0, delay]` is added so that N concurrent
/// workers hitting the same outage do not retry in lock-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per backend, including the first. Default: 4.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds. Default: 500.
    pub base_delay_ms: u64,
    /// Upper bound for a computed backoff delay. Default: 30 000.
    pub max_delay_ms: u64,
    /// Add uniform jitter to computed delays. Default: true.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(PipelineError::InvalidConfig(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

// ── Backends ─────────────────────────────────────────────────────────────

/// Which wire protocol a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible `/chat/completions` endpoint (OpenAI, vLLM,
    /// LM Studio, OpenRouter, Ollama's `/v1`, …). (default)
    #[default]
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// Any provider the `edgequake-llm` factory can build; see
    /// [`BackendConfig::upstream`].
    Edgequake,
}

impl ProviderKind {
    /// Environment variable consulted when no key is configured explicitly.
    pub fn default_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Edgequake => None,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi | ProviderKind::Edgequake => "gpt-4.1-nano",
            ProviderKind::Anthropic => "claude-sonnet-4-20250514",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Edgequake => "edgequake",
        })
    }
}

/// Everything needed to construct one backend client.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Registry key; referenced by [`ChainConfig::order`].
    pub name: String,

    /// Wire protocol. Default: `openai`.
    pub provider: ProviderKind,

    /// Base URL, e.g. `http://localhost:8000/v1`. `None` uses the
    /// provider's public endpoint.
    pub endpoint: Option<String>,

    /// API key. Prefer `api_key_env` in config files.
    pub api_key: Option<String>,

    /// Environment variable holding the API key. Falls back to the
    /// provider's conventional variable (`OPENAI_API_KEY`, …).
    pub api_key_env: Option<String>,

    /// Provider name handed to the `edgequake-llm` factory
    /// (`openai`, `gemini`, `mistral`, `ollama`, …). Required for
    /// [`ProviderKind::Edgequake`], ignored otherwise.
    pub upstream: Option<String>,

    /// Model identifier. `None` uses [`ProviderKind::default_model`].
    pub model: Option<String>,

    /// Per-attempt deadline in seconds. Default: 60.
    pub timeout_secs: u64,

    /// Sampling temperature. Default: 0.1.
    ///
    /// Transcription wants the model faithful to what it sees, not creative.
    pub temperature: f32,

    /// Maximum output tokens per page. Default: 4096.
    pub max_tokens: usize,

    /// Custom instruction. `None` uses [`crate::prompts::DEFAULT_INSTRUCTION`].
    pub instruction: Option<String>,

    /// Retry budget for this backend.
    pub retry: RetryConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider: ProviderKind::default(),
            endpoint: None,
            api_key: None,
            api_key_env: None,
            upstream: None,
            model: None,
            timeout_secs: 60,
            temperature: 0.1,
            max_tokens: 4096,
            instruction: None,
            retry: RetryConfig::default(),
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("upstream", &self.upstream)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("retry", &self.retry)
            .finish()
    }
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            name: name.into(),
            provider,
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model_or_default(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.provider.default_model())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Explicit key first, then the named env var, then the provider default.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        let var = self
            .api_key_env
            .as_deref()
            .or_else(|| self.provider.default_key_env())?;
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "backend name must not be empty".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "backend '{}': timeout_secs must be ≥ 1",
                self.name
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::InvalidConfig(format!(
                "backend '{}': temperature must be 0.0–2.0, got {}",
                self.name, self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "backend '{}': max_tokens must be ≥ 1",
                self.name
            )));
        }
        if self.provider == ProviderKind::Edgequake
            && self.upstream.as_deref().is_none_or(str::is_empty)
        {
            return Err(PipelineError::InvalidConfig(format!(
                "backend '{}': provider 'edgequake' needs an 'upstream' provider name",
                self.name
            )));
        }
        self.retry.validate().map_err(|e| match e {
            PipelineError::InvalidConfig(msg) => {
                PipelineError::InvalidConfig(format!("backend '{}': {msg}", self.name))
            }
            other => other,
        })
    }
}

// ── Fallback ─────────────────────────────────────────────────────────────

/// What the fallback chain does after a backend gives up non-retryably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainAction {
    /// Fail the unit without trying the remaining backends. (default)
    #[default]
    Stop,
    /// Try the next backend in the chain.
    Continue,
}

/// Short-circuit policy for the fallback chain.
///
/// Exhausting the retry budget on a transient failure always moves on to the
/// next backend. Only non-retryable give-ups consult this policy, split by
/// [`crate::error::Blame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackPolicy {
    /// The unit itself was rejected (4xx other than auth/quota/not-found).
    pub on_input_error: ChainAction,
    /// The provider is unusable: auth, quota, unknown model, malformed replies.
    pub on_provider_error: ChainAction,
}

impl FallbackPolicy {
    /// Try every backend regardless of why the previous one gave up.
    pub fn exhaustive() -> Self {
        Self {
            on_input_error: ChainAction::Continue,
            on_provider_error: ChainAction::Continue,
        }
    }
}

/// Backends plus the order and policy used to chain them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub backends: Vec<BackendConfig>,
    /// Backend names in priority order. Empty means declaration order.
    pub order: Vec<String>,
    pub policy: FallbackPolicy,
}

impl ChainConfig {
    /// Parse a chain definition from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        let config: ChainConfig = serde_json::from_str(json)
            .map_err(|e| PipelineError::InvalidConfig(format!("backend config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON chain definition from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json_str(&text)
    }

    /// Effective priority order: `order` if set, declaration order otherwise.
    pub fn resolved_order(&self) -> Vec<String> {
        if self.order.is_empty() {
            self.backends.iter().map(|b| b.name.clone()).collect()
        } else {
            self.order.clone()
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.backends.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one backend must be configured".into(),
            ));
        }
        let mut seen = HashSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !seen.insert(backend.name.as_str()) {
                return Err(PipelineError::DuplicateBackend {
                    name: backend.name.clone(),
                });
            }
        }
        for name in &self.order {
            if !seen.contains(name.as_str()) {
                return Err(PipelineError::UnknownBackend {
                    name: name.clone(),
                    known: self
                        .backends
                        .iter()
                        .map(|b| b.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }
        Ok(())
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Configuration for one conversion run.
///
/// Built via [`PipelineConfig::builder()`].
///
/// # Example
/// ```rust
/// use edgequake_ocr::{BackendConfig, PipelineConfig, ProviderKind};
///
/// let config = PipelineConfig::builder()
///     .concurrency(4)
///     .backend(
///         BackendConfig::new("local", ProviderKind::OpenAi)
///             .with_endpoint("http://localhost:8000/v1")
///             .with_model("qwen2-vl"),
///     )
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 4);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Maximum pages in flight at once. Default: 10.
    ///
    /// VLM calls are network-bound; the limit exists to cap memory and the
    /// outbound request rate, not CPU. Lower it if 429s dominate the logs.
    pub concurrency: usize,

    /// How long in-flight pages may keep running after cancellation. Default: 5000 ms.
    pub grace_period_ms: u64,

    /// Backends, priority order and short-circuit policy.
    pub chain: ChainConfig,

    /// Separator between pages in the assembled text. Default: blank line.
    pub page_separator: PageSeparator,

    /// Run [`crate::postprocess::clean_text`] on each page. Default: true.
    pub postprocess: bool,

    /// Lifecycle event sink. Default: none.
    pub progress: Option<Arc<dyn ProgressSink>>,

    /// Cooperative cancellation for the whole run. Default: none.
    pub cancellation: Option<CancellationToken>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            grace_period_ms: 5_000,
            chain: ChainConfig::default(),
            page_separator: PageSeparator::default(),
            postprocess: true,
            progress: None,
            cancellation: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("concurrency", &self.concurrency)
            .field("grace_period_ms", &self.grace_period_ms)
            .field("chain", &self.chain)
            .field("page_separator", &self.page_separator)
            .field("postprocess", &self.postprocess)
            .field("progress", &self.progress.as_ref().map(|_| "<dyn ProgressSink>"))
            .field("cancellation", &self.cancellation.is_some())
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn grace_period_ms(mut self, ms: u64) -> Self {
        self.config.grace_period_ms = ms;
        self
    }

    /// Append one backend; the first one added has the highest priority
    /// unless [`Self::fallback_order`] says otherwise.
    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.config.chain.backends.push(backend);
        self
    }

    /// Replace the whole chain definition.
    pub fn chain(mut self, chain: ChainConfig) -> Self {
        self.config.chain = chain;
        self
    }

    pub fn fallback_order<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.chain.order = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn fallback_policy(mut self, policy: FallbackPolicy) -> Self {
        self.config.chain.policy = policy;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn postprocess(mut self, v: bool) -> Self {
        self.config.postprocess = v;
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.config.progress = Some(sink);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.config.cancellation = Some(token);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        if self.config.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        self.config.chain.validate()?;
        Ok(self.config)
    }
}

// ── Output assembly ──────────────────────────────────────────────────────

/// How to separate pages in the assembled text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// Blank line between pages. (default)
    #[default]
    None,
    /// Horizontal rule: "\n\n---\n\n"
    HorizontalRule,
    /// HTML comment naming the page that follows: "<!-- page N -->"
    Comment,
    /// Custom marker inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator placed before the given page (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {page_num} -->\n\n"),
            PageSeparator::Custom(s) => format!("\n\n{s}\n\n"),
        }
    }
}
