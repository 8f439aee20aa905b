//! Wire helpers shared by the HTTP backends.
//!
//! Payload encoding, the request/response round trip, and the mapping of
//! transport failures and status codes onto [`ErrorClass`].

use crate::error::{BackendError, PipelineError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::{Duration, SystemTime};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Build the pooled client a backend keeps for its whole lifetime.
///
/// Only the connect phase is bounded here; the per-attempt deadline is
/// enforced by the fallback chain.
pub(crate) fn build_client(backend: &str) -> Result<reqwest::Client, PipelineError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(concat!("edgequake-ocr/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PipelineError::ClientBuild {
            backend: backend.to_string(),
            detail: e.to_string(),
        })
}

/// A page payload ready to embed in a JSON request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime: &'static str,
    pub data: String,
}

impl EncodedImage {
    pub fn encode(payload: &[u8]) -> Self {
        let data = STANDARD.encode(payload);
        debug!("Encoded page payload → {} bytes base64", data.len());
        Self {
            mime: payload_mime(payload),
            data,
        }
    }

    /// `data:<mime>;base64,<data>` as OpenAI-style `image_url`s expect.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.data)
    }
}

/// Sniff the MIME type from the payload's magic bytes.
///
/// Unknown payloads are labelled `application/octet-stream` and sent as-is;
/// the provider's rejection then surfaces as an input error for that page.
pub fn payload_mime(payload: &[u8]) -> &'static str {
    image::guess_format(payload)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

/// Send a request and decode a successful JSON body.
///
/// Non-2xx statuses become a [`BackendError`] classified by status code,
/// with the provider's `Retry-After` hint attached to 429s.
pub(crate) async fn send_json(request: RequestBuilder) -> Result<Value, BackendError> {
    let response = request.send().await.map_err(|e| transport_error(&e))?;
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.map_err(|e| transport_error(&e))?;

    if !status.is_success() {
        return Err(BackendError::from_status(
            status.as_u16(),
            retry_after,
            error_message(status, &body),
        ));
    }

    serde_json::from_str(&body)
        .map_err(|e| BackendError::malformed(format!("response is not valid JSON: {e}")))
}

/// Classify a `reqwest` transport failure.
pub(crate) fn transport_error(err: &reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::timeout(err.to_string())
    } else if err.is_decode() {
        BackendError::malformed(err.to_string())
    } else {
        BackendError::connection(err.to_string())
    }
}

/// Read the provider's retry hint.
///
/// `retry-after-ms` (fractional milliseconds) wins over `retry-after`,
/// which may be delta-seconds or an HTTP-date. A date in the past means
/// "now". Values too large for a `Duration` count as no hint.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };
    let seconds = |v: &str| {
        v.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
    };

    if let Some(ms) = header("retry-after-ms").and_then(seconds) {
        return Duration::try_from_secs_f64(ms / 1_000.0).ok();
    }
    let value = header("retry-after")?;
    if let Some(secs) = seconds(value) {
        return Duration::try_from_secs_f64(secs).ok();
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}

/// Best-effort human message from an error body.
pub fn error_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        json["error"]["message"]
            .as_str()
            .or_else(|| json["error"].as_str())
            .or_else(|| json["message"].as_str())
            .map(str::to_string)
    });
    if let Some(msg) = from_json {
        return msg;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {status}");
    }
    let mut msg: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    if trimmed.chars().count() > MAX_ERROR_BODY_CHARS {
        msg.push('…');
    }
    msg
}

/// Flatten a message `content` field into one string.
///
/// Accepts a bare string or a list of parts; parts may be strings or
/// objects with a `text` field. Non-text parts (images, tool calls) are
/// skipped. Returns `None` when nothing textual is present.
pub fn normalize_content(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts.iter().filter_map(part_text).collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.concat())
            }
        }
        _ => None,
    }
}

fn part_text(part: &Value) -> Option<&str> {
    match part {
        Value::String(s) => Some(s),
        Value::Object(map) => {
            let kind = map.get("type").and_then(Value::as_str);
            if kind.is_some_and(|k| k != "text" && k != "output_text") {
                return None;
            }
            map.get("text").and_then(Value::as_str)
        }
        _ => None,
    }
}

/// Token counter from a usage object, zero when absent.
pub(crate) fn usage_count(usage: &Value, key: &str) -> u64 {
    usage[key].as_u64().unwrap_or(0)
}
