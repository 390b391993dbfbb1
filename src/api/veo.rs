use super::{InlineImage, classify_error_object, classify_failure, mime_for};
use crate::config::Config;
use crate::jobs::{JobDescriptor, VideoParams};
use crate::runner::{Artifact, Generate, GenerateError};
use crate::{logi, logw};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30 * 60);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Video generation through `predictLongRunning`: submit, poll the operation
/// until it reports `done`, then download the first generated sample.
pub struct VeoVideoGenerator {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    poll_interval: Duration,
    max_wait: Duration,
}

impl VeoVideoGenerator {
    pub fn new(client: Client, cfg: &Config, model: &str) -> Self {
        Self {
            client,
            api_base: cfg.api_base.clone(),
            api_key: cfg.api_key.clone(),
            model: model.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    /// Overrides the poll cadence. Intervals below one second are raised to
    /// `MIN_POLL_INTERVAL`.
    pub fn with_polling(mut self, interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self.max_wait = max_wait;
        self
    }

    async fn start_frame(&self, params: &VideoParams) -> Result<Option<InlineImage>> {
        let Some(path) = params.start_frame.as_deref() else {
            return Ok(None);
        };
        if !fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false) {
            logw(format!("    Start frame not found, using text-to-video: {}", path.display()));
            return Ok(None);
        }
        logi(format!("    Start frame: {}", path.display()));
        Ok(Some(InlineImage::load(path).await?))
    }

    async fn get_json(&self, url: &str) -> Result<Value, GenerateError> {
        let resp = self
            .client
            .get(url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .context("Veo request failed")?;
        let status = resp.status();
        let raw = resp.text().await.context("Veo response read failed")?;
        if !status.is_success() {
            return Err(classify_failure("Veo", status, &raw));
        }
        Ok(serde_json::from_str(&raw).context("Veo response was not JSON")?)
    }

    async fn submit(&self, body: &Value) -> Result<String, GenerateError> {
        let url = format!("{}/models/{}:predictLongRunning", self.api_base, self.model);
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .context("Veo submit failed")?;
        let status = resp.status();
        let raw = resp.text().await.context("Veo response read failed")?;
        if !status.is_success() {
            return Err(classify_failure("Veo", status, &raw));
        }
        let root: Value = serde_json::from_str(&raw).context("Veo response was not JSON")?;
        operation_name(&root)
    }

    async fn poll(&self, name: &str) -> Result<Value, GenerateError> {
        let url = format!("{}/{}", self.api_base, name);
        let started = Instant::now();
        loop {
            let op = self.get_json(&url).await?;
            if is_done(&op) {
                return Ok(op);
            }
            if started.elapsed() >= self.max_wait {
                return Err(GenerateError::Other(anyhow::anyhow!(
                    "Veo operation {} not done after {}s",
                    name,
                    started.elapsed().as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
            logi(format!("    Waiting... ({}s)", started.elapsed().as_secs()));
        }
    }

    /// Video bytes plus the MIME type the server reported, if any.
    async fn download(&self, uri: &str) -> Result<(Vec<u8>, Option<String>), GenerateError> {
        let resp = self
            .client
            .get(uri)
            .header("x-goog-api-key", &self.api_key)
            .timeout(Duration::from_secs(600))
            .send()
            .await
            .context("Veo download failed")?;
        let status = resp.status();
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            return Err(classify_failure("Veo download", status, &raw));
        }
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| v.starts_with("video/"));
        let bytes = resp.bytes().await.context("Veo download read failed")?;
        Ok((bytes.to_vec(), mime))
    }
}

pub fn video_request_body(params: &VideoParams, start_frame: Option<&InlineImage>) -> Value {
    let mut instance = json!({ "prompt": params.prompt });
    if let Some(img) = start_frame {
        instance["image"] = json!({
            "bytesBase64Encoded": img.data_b64,
            "mimeType": img.mime_type,
        });
    }

    let mut parameters = json!({
        "aspectRatio": params.aspect_ratio,
        "resolution": params.resolution,
        "durationSeconds": params.duration_seconds,
    });
    if let Some(neg) = params.negative_prompt.as_deref().filter(|n| !n.trim().is_empty()) {
        parameters["negativePrompt"] = json!(neg);
    }

    json!({ "instances": [instance], "parameters": parameters })
}

pub fn operation_name(root: &Value) -> Result<String, GenerateError> {
    if let Some(err) = root.get("error") {
        return Err(classify_error_object("Veo", err));
    }
    root.get("name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GenerateError::Other(anyhow::anyhow!("Veo submit returned no operation name")))
}

pub fn is_done(op: &Value) -> bool {
    op.get("done").and_then(|v| v.as_bool()).unwrap_or(false)
}

/// URI of the first generated sample of a finished operation.
pub fn extract_video_uri(op: &Value) -> Result<String, GenerateError> {
    if let Some(err) = op.get("error") {
        return Err(classify_error_object("Veo", err));
    }

    let response = op.get("response");
    let uri = response
        .and_then(|r| r.pointer("/generateVideoResponse/generatedSamples/0/video/uri"))
        .or_else(|| response.and_then(|r| r.pointer("/generatedVideos/0/video/uri")))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());

    match uri {
        Some(uri) => Ok(uri.to_string()),
        None => {
            let filtered = response
                .and_then(|r| r.pointer("/generateVideoResponse/raiMediaFilteredReasons/0"))
                .and_then(|v| v.as_str())
                .unwrap_or("no generated videos");
            Err(GenerateError::NoArtifact(filtered.to_string()))
        }
    }
}

#[async_trait]
impl Generate<VideoParams> for VeoVideoGenerator {
    async fn generate(&self, job: &JobDescriptor<VideoParams>) -> Result<Artifact, GenerateError> {
        let params = job.params();
        logi(format!(
            "    Aspect: {}, Resolution: {}, Duration: {}s",
            params.aspect_ratio, params.resolution, params.duration_seconds
        ));

        let frame = self.start_frame(params).await?;
        let body = video_request_body(params, frame.as_ref());

        let name = self.submit(&body).await?;
        let op = self.poll(&name).await?;
        let uri = extract_video_uri(&op)?;
        let (bytes, mime) = self.download(&uri).await?;

        Ok(Artifact {
            bytes,
            mime_type: mime.unwrap_or_else(|| mime_for(job.output()).to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn local_config(api_base: String) -> Config {
        Config {
            api_key: "k".into(),
            project_root: PathBuf::from("."),
            api_base,
        }
    }

    /// Serves `body` as JSON to every request and counts the requests.
    async fn serve_json(body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), hits)
    }

    fn params() -> VideoParams {
        VideoParams {
            prompt: "The bus idles.".into(),
            aspect_ratio: "16:9".into(),
            resolution: "720p".into(),
            duration_seconds: 6,
            start_frame: Some(PathBuf::from("/nowhere/frame.png")),
            negative_prompt: Some("faces".into()),
        }
    }

    #[test]
    fn text_to_video_body_has_no_image() {
        let body = video_request_body(&params(), None);
        assert_eq!(body["instances"][0]["prompt"], "The bus idles.");
        assert!(body["instances"][0].get("image").is_none());
        assert_eq!(body["parameters"]["durationSeconds"], 6);
        assert_eq!(body["parameters"]["negativePrompt"], "faces");
    }

    #[test]
    fn image_to_video_body_inlines_start_frame() {
        let frame = InlineImage { mime_type: "image/png".into(), data_b64: "QlVT".into() };
        let mut p = params();
        p.negative_prompt = None;
        let body = video_request_body(&p, Some(&frame));
        assert_eq!(body["instances"][0]["image"]["bytesBase64Encoded"], "QlVT");
        assert_eq!(body["instances"][0]["image"]["mimeType"], "image/png");
        assert!(body["parameters"].get("negativePrompt").is_none());
    }

    #[test]
    fn operation_lifecycle_parsing() {
        let submitted = serde_json::json!({"name": "models/veo/operations/abc"});
        assert_eq!(operation_name(&submitted).unwrap(), "models/veo/operations/abc");
        assert!(!is_done(&submitted));

        let finished = serde_json::json!({
            "name": "models/veo/operations/abc",
            "done": true,
            "response": {"generateVideoResponse": {"generatedSamples": [
                {"video": {"uri": "https://example.invalid/files/abc:download"}}
            ]}}
        });
        assert!(is_done(&finished));
        assert_eq!(
            extract_video_uri(&finished).unwrap(),
            "https://example.invalid/files/abc:download"
        );
    }

    #[test]
    fn finished_without_samples_is_missing_artifact() {
        let op = serde_json::json!({
            "done": true,
            "response": {"generateVideoResponse": {"raiMediaFilteredReasons": ["filtered by safety"]}}
        });
        match extract_video_uri(&op) {
            Err(GenerateError::NoArtifact(why)) => assert_eq!(why, "filtered by safety"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn quota_error_in_operation_is_retryable() {
        let op = serde_json::json!({"done": true, "error": {"code": 8, "status": "RESOURCE_EXHAUSTED", "message": "quota"}});
        assert!(extract_video_uri(&op).unwrap_err().is_retryable());

        let other = serde_json::json!({"done": true, "error": {"code": 3, "message": "bad prompt"}});
        assert!(!extract_video_uri(&other).unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn missing_start_frame_falls_back_to_text() {
        let cfg = local_config("http://127.0.0.1:1".into());
        let generator = VeoVideoGenerator::new(Client::new(), &cfg, "veo");
        assert!(generator.start_frame(&params()).await.unwrap().is_none());
    }

    #[test]
    fn zero_poll_interval_is_raised_to_minimum() {
        let cfg = local_config("http://127.0.0.1:1".into());
        let generator = VeoVideoGenerator::new(Client::new(), &cfg, "veo")
            .with_polling(Duration::ZERO, Duration::from_secs(5));
        assert_eq!(generator.poll_interval, MIN_POLL_INTERVAL);
        assert_eq!(generator.max_wait, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unfinished_operation_gives_up_after_max_wait() {
        let (base, hits) = serve_json(r#"{"done": false}"#).await;
        let generator = VeoVideoGenerator::new(Client::new(), &local_config(base), "veo")
            .with_polling(Duration::ZERO, Duration::from_millis(200));

        let outcome = tokio::time::timeout(Duration::from_secs(5), generator.poll("operations/x"))
            .await
            .expect("poll loop must stop on its own");
        assert!(matches!(outcome, Err(GenerateError::Other(_))));
        assert!(hits.load(Ordering::SeqCst) <= 3);
    }
}
