//! Document-level entry points.
//!
//! Each one builds the backend registry and the fallback chain from
//! [`PipelineConfig::chain`], runs the controller, cleans and assembles the
//! page texts, and shuts the backends down again.
//!
//! A run in which pages failed still returns `Ok`; the failures are listed
//! in [`ConversionOutput::aggregate`]. Call
//! [`ConversionOutput::into_result`] to treat them as an error.

use crate::backend::BackendRegistry;
use crate::config::PipelineConfig;
use crate::controller::ConcurrencyController;
use crate::error::PipelineError;
use crate::fallback::FallbackChain;
use crate::input;
use crate::output::{ConversionOutput, ConversionStats};
use crate::postprocess::clean_text;
use crate::unit::ConversionUnit;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Convert raw page images, in order.
///
/// # Example
/// ```rust,no_run
/// use edgequake_ocr::{convert_pages, BackendConfig, PipelineConfig, ProviderKind};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pages = vec![std::fs::read("scan-1.png")?, std::fs::read("scan-2.png")?];
/// let config = PipelineConfig::builder()
///     .backend(BackendConfig::new("openai", ProviderKind::OpenAi))
///     .build()?;
/// let output = convert_pages(pages, &config).await?;
/// println!("{}", output.text);
/// # Ok(())
/// # }
/// ```
pub async fn convert_pages(
    pages: Vec<Vec<u8>>,
    config: &PipelineConfig,
) -> Result<ConversionOutput, PipelineError> {
    convert_units(ConversionUnit::from_pages(pages), config).await
}

/// Convert page image files; directories expand to the images inside them.
pub async fn convert_files(
    inputs: &[PathBuf],
    config: &PipelineConfig,
) -> Result<ConversionOutput, PipelineError> {
    let units = input::load_units(inputs).await?;
    convert_units(units, config).await
}

/// Convert prepared units with the backends configured in `config.chain`.
pub async fn convert_units(
    units: Vec<ConversionUnit>,
    config: &PipelineConfig,
) -> Result<ConversionOutput, PipelineError> {
    if units.is_empty() {
        return Err(PipelineError::NoInput);
    }
    config.chain.validate()?;
    let registry = BackendRegistry::from_configs(&config.chain.backends)?;
    let chain = Arc::new(FallbackChain::from_config(&registry, &config.chain)?);

    let output = convert_with_chain(units, chain, config).await;
    registry.shutdown().await;
    output
}

/// Convert prepared units with a caller-built chain.
///
/// `config.chain` is ignored; everything else in `config` applies.
pub async fn convert_with_chain(
    units: Vec<ConversionUnit>,
    chain: Arc<FallbackChain>,
    config: &PipelineConfig,
) -> Result<ConversionOutput, PipelineError> {
    let total_start = Instant::now();
    let cancel = config
        .cancellation
        .clone()
        .unwrap_or_else(CancellationToken::new);

    let mut aggregate = ConcurrencyController::from_config(config)
        .run_with_cancel(units, chain, cancel)
        .await?;

    if config.postprocess {
        for result in aggregate.results.iter_mut().filter(|r| r.is_success()) {
            result.content = clean_text(&result.content);
        }
    }

    let text = aggregate.assemble(&config.page_separator);
    let stats = ConversionStats::from_aggregate(&aggregate, total_start.elapsed());

    if aggregate.failed > 0 {
        warn!("{}/{} pages failed", aggregate.failed, aggregate.total_units);
    }
    info!(
        "Conversion finished: {}/{} pages, {} attempts, {} input / {} output tokens, {}ms",
        stats.processed_pages,
        stats.total_pages,
        stats.total_attempts,
        stats.total_input_tokens,
        stats.total_output_tokens,
        stats.total_duration_ms
    );

    Ok(ConversionOutput {
        text,
        aggregate,
        stats,
    })
}

/// Convert files and write the assembled text to `output_path`.
///
/// The file is written to a temporary sibling first and renamed into place,
/// so readers never observe a half-written document.
pub async fn convert_to_file(
    inputs: &[PathBuf],
    output_path: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<ConversionStats, PipelineError> {
    let output = convert_files(inputs, config).await?;
    write_atomic(output_path.as_ref(), output.text.as_bytes()).await?;
    Ok(output.stats)
}

/// Blocking wrapper around [`convert_files`].
///
/// Creates a temporary tokio runtime internally; do not call from async code.
pub fn convert_sync(
    inputs: &[PathBuf],
    config: &PipelineConfig,
) -> Result<ConversionOutput, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(convert_files(inputs, config))
}

/// Write `contents` to `path` via a temporary file in the same directory.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PipelineError> {
    let write_err = |source: std::io::Error| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&parent).await.map_err(write_err)?;

    let target = path.to_path_buf();
    let contents = contents.to_vec();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("output writer task failed: {e}")))?
    .map_err(write_err)?;

    debug!("Wrote {}", path.display());
    Ok(())
}
