use crate::runner::GenerateError;
use anyhow::{Context, Result};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use std::ffi::OsStr;
use std::path::Path;
use tokio::fs;

pub mod gemini;
pub mod veo;

static RATE_LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b429\b|RESOURCE_EXHAUSTED").expect("valid rate-limit regex"));

pub fn mentions_rate_limit(text: &str) -> bool {
    RATE_LIMIT_RE.is_match(text)
}

fn snippet(body: &str) -> String {
    body.chars().take(800).collect()
}

/// Maps a failed HTTP response to the runner's retry taxonomy.
pub fn classify_failure(service: &str, status: StatusCode, body: &str) -> GenerateError {
    let detail = format!("{} HTTP {}: {}", service, status.as_u16(), snippet(body));
    if status == StatusCode::TOO_MANY_REQUESTS || mentions_rate_limit(body) {
        GenerateError::RateLimited(detail)
    } else {
        GenerateError::Other(anyhow::anyhow!(detail))
    }
}

/// Maps an `error` object embedded in a JSON body (`{code, message, status}`).
pub fn classify_error_object(service: &str, err: &serde_json::Value) -> GenerateError {
    let code = err.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
    let status = err.get("status").and_then(|v| v.as_str()).unwrap_or("");
    let message = err.get("message").and_then(|v| v.as_str()).unwrap_or("");
    let detail = format!("{} error {} {}: {}", service, code, status, message);

    if code == 429 || status == "RESOURCE_EXHAUSTED" || mentions_rate_limit(message) {
        GenerateError::RateLimited(detail)
    } else {
        GenerateError::Other(anyhow::anyhow!(detail))
    }
}

/// MIME type implied by a known file extension.
pub fn expected_mime(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(OsStr::to_str)
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => Some("image/png"),
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        Some("webp") => Some("image/webp"),
        Some("mp4") => Some("video/mp4"),
        _ => None,
    }
}

pub fn mime_for(path: &Path) -> &'static str {
    expected_mime(path).unwrap_or("image/png")
}

/// An image encoded for an inline request part.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data_b64: String,
}

impl InlineImage {
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("Failed to read image {}", path.display()))?;
        Ok(Self {
            mime_type: mime_for(path).to_string(),
            data_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }
}

pub fn decode_b64(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .context("Invalid base64 payload")
}
