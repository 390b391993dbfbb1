use super::{InlineImage, classify_error_object, classify_failure, decode_b64};
use crate::config::Config;
use crate::jobs::{ImageParams, JobDescriptor};
use crate::logi;
use crate::runner::{Artifact, Generate, GenerateError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Image generation through `generateContent`. The reference images are
/// read once and sent unchanged with every prompt.
pub struct GeminiImageGenerator {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    references: Vec<InlineImage>,
}

impl GeminiImageGenerator {
    pub async fn new(client: Client, cfg: &Config, model: &str, references: &[PathBuf]) -> Result<Self> {
        let mut loaded = Vec::with_capacity(references.len());
        for path in references {
            loaded.push(InlineImage::load(path).await?);
        }
        logi(format!("Loaded {} reference image(s)", loaded.len()));

        Ok(Self {
            client,
            api_base: cfg.api_base.clone(),
            api_key: cfg.api_key.clone(),
            model: model.to_string(),
            references: loaded,
        })
    }
}

pub fn image_request_body(prompt: &str, aspect_ratio: &str, references: &[InlineImage]) -> Value {
    let mut parts = vec![json!({ "text": prompt })];
    for img in references {
        parts.push(json!({
            "inline_data": {
                "mime_type": img.mime_type,
                "data": img.data_b64,
            }
        }));
    }

    json!({
        "contents": [{ "parts": parts }],
        "generationConfig": {
            "responseModalities": ["IMAGE"],
            "imageConfig": { "aspectRatio": aspect_ratio },
        },
    })
}

/// First inline image of the first candidate. A response with only text is
/// reported as a missing artifact, with the text attached.
pub fn extract_image(root: &Value) -> Result<Artifact, GenerateError> {
    if let Some(err) = root.get("error") {
        return Err(classify_error_object("Gemini", err));
    }

    let parts = root
        .pointer("/candidates/0/content/parts")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    for part in &parts {
        let inline = part.get("inlineData").or_else(|| part.get("inline_data"));
        if let Some(inline) = inline {
            let data = inline.get("data").and_then(|v| v.as_str()).unwrap_or("");
            if data.is_empty() {
                continue;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(|v| v.as_str())
                .unwrap_or("image/png")
                .to_string();
            let bytes = decode_b64(data).map_err(GenerateError::Other)?;
            return Ok(Artifact { bytes, mime_type });
        }
        if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
            text.push_str(t);
        }
    }

    let reason = root
        .pointer("/candidates/0/finishReason")
        .or_else(|| root.pointer("/promptFeedback/blockReason"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let detail = match (text.trim().is_empty(), reason.is_empty()) {
        (true, true) => "no image part".to_string(),
        (true, false) => format!("finish reason {}", reason),
        (false, _) => format!("response text: {}", text.trim()),
    };
    Err(GenerateError::NoArtifact(detail))
}

#[async_trait]
impl Generate<ImageParams> for GeminiImageGenerator {
    async fn generate(&self, job: &JobDescriptor<ImageParams>) -> Result<Artifact, GenerateError> {
        let params = job.params();
        let url = format!("{}/models/{}:generateContent", self.api_base, self.model);
        let body = image_request_body(&params.prompt, &params.aspect_ratio, &self.references);

        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await
            .context("Gemini request failed")?;

        let status = resp.status();
        let raw = resp.text().await.context("Gemini response read failed")?;
        if !status.is_success() {
            return Err(classify_failure("Gemini", status, &raw));
        }

        let root: Value = serde_json::from_str(&raw).context("Gemini response was not JSON")?;
        extract_image(&root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs() -> Vec<InlineImage> {
        vec![
            InlineImage { mime_type: "image/png".into(), data_b64: "QlVT".into() },
            InlineImage { mime_type: "image/png".into(), data_b64: "TE9HTw==".into() },
        ]
    }

    #[test]
    fn request_carries_prompt_then_every_reference() {
        let body = image_request_body("bus as tow truck", "1:1", &refs());
        let parts = body.pointer("/contents/0/parts").unwrap().as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["text"], "bus as tow truck");
        assert_eq!(parts[1]["inline_data"]["data"], "QlVT");
        assert_eq!(parts[2]["inline_data"]["data"], "TE9HTw==");
        assert_eq!(body["generationConfig"]["imageConfig"]["aspectRatio"], "1:1");
        assert_eq!(body["generationConfig"]["responseModalities"][0], "IMAGE");
    }

    #[test]
    fn picks_inline_image_after_text_parts() {
        let resp = serde_json::json!({
            "candidates": [{"content": {"parts": [
                {"text": "Here is your bus"},
                {"inlineData": {"mimeType": "image/png", "data": "iVBORw=="}}
            ]}}]
        });
        let artifact = extract_image(&resp).unwrap();
        assert_eq!(artifact.mime_type, "image/png");
        assert_eq!(artifact.bytes, vec![0x89, 0x50, 0x4e, 0x47]);
    }

    #[test]
    fn text_only_response_is_missing_artifact() {
        let resp = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "I can't draw that."}]}, "finishReason": "STOP"}]
        });
        match extract_image(&resp) {
            Err(GenerateError::NoArtifact(detail)) => assert!(detail.contains("I can't draw that.")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn blocked_prompt_reports_reason() {
        let resp = serde_json::json!({"promptFeedback": {"blockReason": "SAFETY"}});
        match extract_image(&resp) {
            Err(GenerateError::NoArtifact(detail)) => assert!(detail.contains("SAFETY")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn embedded_quota_error_is_retryable() {
        let resp = serde_json::json!({"error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "quota"}});
        assert!(extract_image(&resp).unwrap_err().is_retryable());
    }
}
