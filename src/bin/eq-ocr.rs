//! CLI binary for edgequake-ocr.
//!
//! Maps flags (or a `--backends` JSON file) to a `PipelineConfig`, runs the
//! conversion with a live progress bar, and prints or writes the text.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_ocr::{
    convert_files, convert_to_file, BackendConfig, CancellationToken, ChainAction, ChainConfig,
    PageSeparator, PipelineConfig, ProgressEvent, ProgressSink, ProviderKind, RetryConfig,
    RunStatus,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress bar sink ────────────────────────────────────────────────────

/// Renders run events on a single indicatif bar, one log line per page.
/// Pages finish out of order; the bar only counts them.
struct CliProgressSink {
    bar: ProgressBar,
}

impl CliProgressSink {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Loading pages…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  \
                 ⏱ {elapsed_precise}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }
}

fn truncate(msg: &str, max: usize) -> String {
    if msg.chars().count() > max {
        let cut: String = msg.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    } else {
        msg.to_string()
    }
}

impl ProgressSink for CliProgressSink {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { total_units } => {
                self.start(*total_units);
                self.bar.println(format!(
                    "{} {}",
                    bold("◆"),
                    bold(&format!("Converting {total_units} pages…"))
                ));
            }
            ProgressEvent::UnitStarted { index, .. } => {
                self.bar.set_message(format!("page {}", index + 1));
            }
            ProgressEvent::UnitCompleted {
                index,
                backend,
                attempts,
                content_len,
                elapsed_ms,
            } => {
                let retried = if *attempts > 1 {
                    format!("  {}", yellow(&format!("{attempts} attempts")))
                } else {
                    String::new()
                };
                self.bar.println(format!(
                    "  {} Page {:>3}  {}  {}  {}{}",
                    green("✓"),
                    index + 1,
                    dim(&format!("{content_len:>5} chars")),
                    dim(&format!("{:.1}s", *elapsed_ms as f64 / 1000.0)),
                    dim(backend),
                    retried,
                ));
                self.bar.inc(1);
            }
            ProgressEvent::UnitFailed {
                index,
                error,
                elapsed_ms,
                ..
            } => {
                self.bar.println(format!(
                    "  {} Page {:>3}  {}  {}",
                    red("✗"),
                    index + 1,
                    red(&truncate(error, 100)),
                    dim(&format!("{:.1}s", *elapsed_ms as f64 / 1000.0)),
                ));
                self.bar.inc(1);
            }
            ProgressEvent::UnitAborted { index } => {
                self.bar.println(format!(
                    "  {} Page {:>3}  {}",
                    yellow("⊘"),
                    index + 1,
                    dim("aborted after grace period"),
                ));
                self.bar.inc(1);
            }
            ProgressEvent::RunFinished {
                status,
                succeeded,
                failed,
                not_run,
            } => {
                self.bar.finish_and_clear();
                let total = succeeded + failed + not_run;
                if *status == RunStatus::Cancelled {
                    eprintln!(
                        "{} cancelled: {}/{} pages converted, {} not run",
                        yellow("⚠"),
                        bold(&succeeded.to_string()),
                        total,
                        not_run
                    );
                } else if *failed == 0 {
                    eprintln!(
                        "{} {} pages converted successfully",
                        green("✔"),
                        bold(&succeeded.to_string())
                    );
                } else {
                    eprintln!(
                        "{} {}/{} pages converted  ({} failed)",
                        if *succeeded == 0 { red("✘") } else { yellow("⚠") },
                        bold(&succeeded.to_string()),
                        total,
                        red(&failed.to_string()),
                    );
                }
            }
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # A directory of scanned pages to stdout
  eq-ocr scans/

  # Explicit pages to a file, OpenAI with a specific model
  eq-ocr p1.png p2.png p3.png --model gpt-4.1-mini -o book.md

  # Local OpenAI-compatible server (vLLM, LM Studio, Ollama /v1)
  eq-ocr scans/ --endpoint http://localhost:8000/v1 --model qwen2-vl

  # Primary + backup providers from a JSON chain file
  eq-ocr scans/ --backends chain.json -o out.md

BACKENDS FILE:
  {
    "backends": [
      { "name": "primary", "provider": "openai", "model": "gpt-4.1-nano",
        "retry": { "max_attempts": 4, "base_delay_ms": 500 } },
      { "name": "backup", "provider": "anthropic", "timeout_secs": 90 },
      { "name": "gemini", "provider": "edgequake", "upstream": "gemini",
        "model": "gemini-2.0-flash" }
    ],
    "order": ["primary", "backup", "gemini"],
    "policy": { "on_input_error": "stop", "on_provider_error": "continue" }
  }

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  RUST_LOG                Overrides the log filter (e.g. edgequake_ocr=debug)
"#;

/// Transcribe page images to text using OCR / vision LLM backends.
#[derive(Parser, Debug)]
#[command(
    name = "eq-ocr",
    version,
    about = "Transcribe page images to text with retrying, failing-over vision LLM backends",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Page image files or directories of page images, in document order.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Write text to this file instead of stdout.
    #[arg(short, long, env = "EQ_OCR_OUTPUT")]
    output: Option<PathBuf>,

    /// JSON file describing backends, their order and the fallback policy.
    /// Replaces the single-backend flags below.
    #[arg(long, env = "EQ_OCR_BACKENDS")]
    backends: Option<PathBuf>,

    /// Wire protocol of the single backend: openai, anthropic, edgequake.
    #[arg(long, env = "EQ_OCR_PROVIDER", value_enum, default_value = "openai")]
    provider: ProviderArg,

    /// Model ID. Default depends on the provider.
    #[arg(long, env = "EQ_OCR_MODEL")]
    model: Option<String>,

    /// Base URL of an OpenAI-compatible or Anthropic endpoint.
    #[arg(long, env = "EQ_OCR_ENDPOINT")]
    endpoint: Option<String>,

    /// API key. Prefer the provider's environment variable.
    #[arg(long, env = "EQ_OCR_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// edgequake-llm provider name for `--provider edgequake` (gemini, mistral, ollama, …).
    #[arg(long, env = "EQ_OCR_UPSTREAM")]
    upstream: Option<String>,

    /// Path to a text file with a custom transcription instruction.
    #[arg(long, env = "EQ_OCR_INSTRUCTION")]
    instruction: Option<PathBuf>,

    /// Maximum pages in flight.
    #[arg(short, long, env = "EQ_OCR_CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    /// Attempts per backend, first one included.
    #[arg(long, env = "EQ_OCR_MAX_ATTEMPTS", default_value_t = 4)]
    max_attempts: u32,

    /// First retry delay in milliseconds.
    #[arg(long, env = "EQ_OCR_BASE_DELAY_MS", default_value_t = 500)]
    base_delay_ms: u64,

    /// Cap on a computed retry delay in milliseconds.
    #[arg(long, env = "EQ_OCR_MAX_DELAY_MS", default_value_t = 30_000)]
    max_delay_ms: u64,

    /// Disable random jitter on retry delays.
    #[arg(long)]
    no_jitter: bool,

    /// Per-attempt timeout in seconds.
    #[arg(long, env = "EQ_OCR_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// Max output tokens per page.
    #[arg(long, env = "EQ_OCR_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "EQ_OCR_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Try the next backend when one rejects the page itself (4xx).
    #[arg(long)]
    continue_on_input_error: bool,

    /// Try the next backend on auth, quota or malformed-response failures.
    #[arg(long)]
    continue_on_provider_error: bool,

    /// Seconds in-flight pages may keep running after Ctrl-C.
    #[arg(long, env = "EQ_OCR_GRACE_SECS", default_value_t = 5)]
    grace_secs: u64,

    /// Page separator: none, hr, comment, or a custom string.
    #[arg(long, env = "EQ_OCR_SEPARATOR", default_value = "none")]
    separator: String,

    /// Keep backend output as-is (no fence/whitespace cleanup).
    #[arg(long)]
    raw: bool,

    /// Output structured JSON (ConversionOutput) instead of text.
    #[arg(long, env = "EQ_OCR_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "EQ_OCR_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "EQ_OCR_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "EQ_OCR_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ProviderArg {
    Openai,
    Anthropic,
    Edgequake,
}

impl From<ProviderArg> for ProviderKind {
    fn from(v: ProviderArg) -> Self {
        match v {
            ProviderArg::Openai => ProviderKind::OpenAi,
            ProviderArg::Anthropic => ProviderKind::Anthropic,
            ProviderArg::Edgequake => ProviderKind::Edgequake,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the per-page feedback; keep library logs to
    // errors while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Cancellation ─────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} Ctrl-C: finishing in-flight pages…", yellow("⚠"));
                cancel.cancel();
            }
        });
    }

    let progress: Option<Arc<dyn ProgressSink>> = if show_progress {
        Some(CliProgressSink::new())
    } else {
        None
    };
    let config = build_config(&cli, progress, cancel).await?;

    // ── Run conversion ───────────────────────────────────────────────────
    if let Some(ref output_path) = cli.output {
        let stats = convert_to_file(&cli.inputs, output_path, &config)
            .await
            .context("Conversion failed")?;

        if !cli.quiet {
            eprintln!(
                "{}  {}/{} pages  {}ms  →  {}",
                if stats.failed_pages + stats.skipped_pages == 0 {
                    green("✔")
                } else {
                    yellow("⚠")
                },
                stats.processed_pages,
                stats.total_pages,
                stats.total_duration_ms,
                bold(&output_path.display().to_string()),
            );
            eprintln!(
                "   {} attempts  /  {} tokens in  /  {} tokens out",
                dim(&stats.total_attempts.to_string()),
                dim(&stats.total_input_tokens.to_string()),
                dim(&stats.total_output_tokens.to_string()),
            );
        }
        if stats.total_pages > 0 && stats.processed_pages == 0 {
            anyhow::bail!("No page could be converted");
        }
    } else {
        let output = convert_files(&cli.inputs, &config)
            .await
            .context("Conversion failed")?;

        if cli.json {
            let json =
                serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
            println!("{json}");
        } else {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(output.text.as_bytes())
                .context("Failed to write to stdout")?;
        }

        if !cli.quiet && !show_progress && !cli.json {
            eprintln!(
                "Converted {}/{} pages in {}ms",
                output.stats.processed_pages, output.stats.total_pages, output.stats.total_duration_ms
            );
            for failure in output.aggregate.failures() {
                if let Some(ref err) = failure.error {
                    eprintln!("  {}", red(&err.to_string()));
                }
            }
        }
        if output.stats.total_pages > 0 && output.stats.processed_pages == 0 {
            anyhow::bail!("No page could be converted");
        }
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(
    cli: &Cli,
    progress: Option<Arc<dyn ProgressSink>>,
    cancel: CancellationToken,
) -> Result<PipelineConfig> {
    let mut chain = match cli.backends {
        Some(ref path) => ChainConfig::from_path(path)
            .with_context(|| format!("Failed to load backends from {}", path.display()))?,
        None => ChainConfig {
            backends: vec![single_backend(cli).await?],
            ..ChainConfig::default()
        },
    };
    if cli.continue_on_input_error {
        chain.policy.on_input_error = ChainAction::Continue;
    }
    if cli.continue_on_provider_error {
        chain.policy.on_provider_error = ChainAction::Continue;
    }

    let mut builder = PipelineConfig::builder()
        .concurrency(cli.concurrency)
        .grace_period_ms(cli.grace_secs.saturating_mul(1_000))
        .chain(chain)
        .page_separator(parse_separator(&cli.separator))
        .postprocess(!cli.raw)
        .cancellation(cancel);
    if let Some(sink) = progress {
        builder = builder.progress(sink);
    }
    builder.build().context("Invalid configuration")
}

/// The backend described by the single-backend flags.
async fn single_backend(cli: &Cli) -> Result<BackendConfig> {
    let instruction = match cli.instruction {
        Some(ref path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read instruction from {}", path.display()))?,
        ),
        None => None,
    };
    let provider: ProviderKind = cli.provider.into();
    Ok(BackendConfig {
        name: provider.to_string(),
        provider,
        endpoint: cli.endpoint.clone(),
        api_key: cli.api_key.clone(),
        upstream: cli.upstream.clone(),
        model: cli.model.clone(),
        timeout_secs: cli.timeout,
        temperature: cli.temperature,
        max_tokens: cli.max_tokens,
        instruction,
        retry: RetryConfig {
            max_attempts: cli.max_attempts,
            base_delay_ms: cli.base_delay_ms,
            max_delay_ms: cli.max_delay_ms,
            jitter: !cli.no_jitter,
        },
        ..BackendConfig::default()
    })
}

/// Parse `--separator` into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}
