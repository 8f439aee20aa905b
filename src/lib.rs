//! # edgequake-ocr
//!
//! Turn a sequence of page images into one text document by sending each
//! page to an OCR / vision-language-model backend, with retries, rate-limit
//! awareness, fallback across providers, bounded concurrency and per-page
//! failure isolation.
//!
//! ## Pipeline Overview
//!
//! ```text
//! page images
//!  │
//!  ├─ 1. Input       files / directories → ordered ConversionUnits
//!  ├─ 2. Controller  ≤ N pages in flight (semaphore), results slotted by index
//!  ├─ 3. Chain       backend A ─retry─▶ backend B ─retry─▶ …  first success wins
//!  ├─ 4. Backend     one HTTP request: image + instruction → text
//!  ├─ 5. Polish      fence / whitespace / invisible-character cleanup
//!  └─ 6. Output      assembled text + AggregateResult + stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocr::{convert_files, BackendConfig, PipelineConfig, ProviderKind};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .concurrency(8)
//!         .backend(BackendConfig::new("primary", ProviderKind::OpenAi))
//!         .backend(BackendConfig::new("backup", ProviderKind::Anthropic))
//!         .build()?;
//!     let output = convert_files(&[PathBuf::from("scans/")], &config).await?;
//!     println!("{}", output.text);
//!     eprintln!("{} ok / {} failed", output.aggregate.succeeded, output.aggregate.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `eq-ocr` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-ocr = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod controller;
pub mod convert;
pub mod error;
pub mod fallback;
pub mod input;
pub mod output;
pub mod postprocess;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod unit;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{BackendClient, BackendOutput, BackendRegistry};
pub use config::{
    BackendConfig, ChainAction, ChainConfig, FallbackPolicy, PageSeparator, PipelineConfig,
    PipelineConfigBuilder, ProviderKind, RetryConfig,
};
pub use controller::ConcurrencyController;
pub use convert::{
    convert_files, convert_pages, convert_sync, convert_to_file, convert_units, convert_with_chain,
};
pub use error::{BackendError, BackendFailure, Blame, ErrorClass, PipelineError, UnitError};
pub use fallback::{ChainEntry, ChainFailure, ChainSuccess, FallbackChain};
pub use output::{AggregateResult, AttemptOutcome, ConversionOutput, ConversionStats, RunStatus, UnitResult};
pub use progress::{ChannelProgressSink, NoopProgressSink, ProgressEvent, ProgressSink, ProgressStream};
pub use retry::{Decision, RetryPolicy};
pub use unit::ConversionUnit;
pub use tokio_util::sync::CancellationToken;
