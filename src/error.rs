//! Error types for the edgequake-ocr library.
//!
//! Three layers of failure, each with its own type:
//!
//! * [`PipelineError`]: **Fatal**: the run cannot start at all (bad backend
//!   configuration, missing credentials, unreadable input, malformed unit
//!   sequence). Returned as `Err(PipelineError)` before any unit is dispatched.
//!
//! * [`BackendError`]: **Per attempt**: one request to one backend failed.
//!   Its [`ErrorClass`] is what the retry policy and the fallback chain
//!   reason about; it never leaves the chain.
//!
//! * [`UnitError`]: **Per unit**: every backend in the chain gave up on a
//!   page. Stored inside [`crate::output::UnitResult`] as data so one bad
//!   page never aborts the document.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All fatal errors returned by the edgequake-ocr library.
///
/// Unit-level failures use [`UnitError`] and are stored in
/// [`crate::output::UnitResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// Builder or config-file validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The fallback order names a backend that was never configured.
    #[error("Unknown backend '{name}' in fallback order.\nConfigured backends: {known}")]
    UnknownBackend { name: String, known: String },

    /// Two backend configs share the same name.
    #[error("Backend name '{name}' is configured more than once")]
    DuplicateBackend { name: String },

    /// A provider that needs an API key has none.
    #[error("Backend '{backend}' has no credentials.\n{hint}")]
    MissingCredentials { backend: String, hint: String },

    /// The HTTP client for a backend could not be constructed.
    #[error("Failed to build HTTP client for backend '{backend}': {detail}")]
    ClientBuild { backend: String, detail: String },

    /// The unit sequence handed to the controller is not indexed `0..N`.
    #[error("Invalid unit sequence: {0}")]
    InvalidUnits(String),

    // ── Input errors ──────────────────────────────────────────────────────
    /// No page images were supplied.
    #[error("No page images to convert")]
    NoInput,

    /// Input file was not found at the given path.
    #[error("Page image not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file was read but is not an image format a VLM accepts.
    #[error("File is not a supported page image: '{path}'\nFirst bytes: {magic:?}")]
    NotAnImage { path: PathBuf, magic: Vec<u8> },

    /// Reading an input file failed for another reason.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Result errors ─────────────────────────────────────────────────────
    /// Some units succeeded but at least one failed.
    ///
    /// Returned by [`crate::output::ConversionOutput::into_result`] when
    /// the caller wants to treat any unit failure as an error.
    #[error("{failed}/{total} pages failed during conversion")]
    PartialFailure {
        succeeded: usize,
        failed: usize,
        total: usize,
    },

    /// Every unit failed; the assembled text would be empty.
    #[error("All {total} pages failed.\nFirst error: {first_error}")]
    AllUnitsFailed { total: usize, first_error: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output text file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Attempt-level classification ─────────────────────────────────────────

/// Classification of a single failed backend request.
///
/// The class, not the attempt count, decides whether a retry is worth it:
/// see [`crate::retry::RetryPolicy::decide`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transport failure: DNS, refused connection, reset, TLS.
    Connection,
    /// The request (or the per-attempt deadline) timed out.
    Timeout,
    /// HTTP 429. `retry_after` is the provider's hint when it sent one.
    RateLimited { retry_after: Option<Duration> },
    /// HTTP 4xx other than 429.
    ClientError { status: u16 },
    /// HTTP 5xx.
    ServerError { status: u16 },
    /// 2xx, but the body could not be decoded or carried no content.
    MalformedResponse,
}

/// Who a non-retryable failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blame {
    /// Retrying later (or elsewhere) may succeed.
    Transient,
    /// The unit itself was rejected (bad image, payload too large, …).
    Input,
    /// The provider is unusable for us (auth, quota, unknown model, broken contract).
    Provider,
}

impl ErrorClass {
    /// Whether this class of failure is eligible for another attempt at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Connection
                | ErrorClass::Timeout
                | ErrorClass::RateLimited { .. }
                | ErrorClass::ServerError { .. }
        )
    }

    /// Attribute the failure to the input, the provider, or neither.
    ///
    /// 401/402/403/404/407 mean the provider (or our account on it) is the
    /// problem; every other 4xx is about the request body, i.e. the unit.
    pub fn blame(&self) -> Blame {
        match self {
            ErrorClass::ClientError { status } => match status {
                401 | 402 | 403 | 404 | 407 => Blame::Provider,
                _ => Blame::Input,
            },
            ErrorClass::MalformedResponse => Blame::Provider,
            _ => Blame::Transient,
        }
    }

    /// Provider-supplied retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ErrorClass::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status (assumed non-2xx) to a class.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ErrorClass::RateLimited { retry_after },
            400..=499 => ErrorClass::ClientError { status },
            500..=599 => ErrorClass::ServerError { status },
            _ => ErrorClass::MalformedResponse,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Connection => write!(f, "connection error"),
            ErrorClass::Timeout => write!(f, "timeout"),
            ErrorClass::RateLimited {
                retry_after: Some(d),
            } => write!(f, "rate limited (retry after {}ms)", d.as_millis()),
            ErrorClass::RateLimited { retry_after: None } => write!(f, "rate limited"),
            ErrorClass::ClientError { status } => write!(f, "client error {status}"),
            ErrorClass::ServerError { status } => write!(f, "server error {status}"),
            ErrorClass::MalformedResponse => write!(f, "malformed response"),
        }
    }
}

/// One failed request to one backend.
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct BackendError {
    pub class: ErrorClass,
    pub message: String,
}

impl BackendError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::MalformedResponse, message)
    }

    pub fn from_status(status: u16, retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::from_status(status, retry_after), message)
    }
}

// ── Unit-level errors ────────────────────────────────────────────────────

/// The final error recorded for one backend of a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    /// Backend name as registered.
    pub backend: String,
    /// Attempts made against this backend before it gave up.
    pub attempts: u32,
    /// Classification of the last attempt.
    pub class: ErrorClass,
    /// Provider or transport message of the last attempt.
    pub message: String,
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} attempt{}): {}: {}",
            self.backend,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
            self.class,
            self.message
        )
    }
}

fn last_failure(failures: &[BackendFailure]) -> String {
    failures
        .last()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "no backend was attempted".to_string())
}

/// A non-fatal error for a single unit.
///
/// Stored alongside [`crate::output::UnitResult`] when a unit fails.
/// The run continues for every other unit.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum UnitError {
    /// Every backend in the chain gave up.
    #[error("Page {index}: all {} backend(s) failed; last: {}", .failures.len(), last_failure(.failures))]
    BackendsExhausted {
        index: usize,
        failures: Vec<BackendFailure>,
    },

    /// A non-retryable failure stopped the chain before it was exhausted.
    #[error("Page {index}: fallback stopped at backend '{backend}': {}", last_failure(.failures))]
    FallbackStopped {
        index: usize,
        backend: String,
        failures: Vec<BackendFailure>,
    },

    /// The conversion task panicked; the panic was contained to this unit.
    #[error("Page {index}: conversion task panicked: {detail}")]
    Panicked { index: usize, detail: String },
}

impl UnitError {
    /// Per-backend failure history, oldest first.
    pub fn failures(&self) -> &[BackendFailure] {
        match self {
            UnitError::BackendsExhausted { failures, .. }
            | UnitError::FallbackStopped { failures, .. } => failures,
            UnitError::Panicked { .. } => &[],
        }
    }
}
