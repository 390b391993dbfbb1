use crate::backoff::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_VIDEO_MODEL: &str = "veo-3.1-generate-preview";

/// One unit of work: a unique id, its generation parameters and the place
/// its artifact lives.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor<P> {
    id: String,
    params: P,
    output: PathBuf,
}

impl<P> JobDescriptor<P> {
    pub fn new(id: impl Into<String>, params: P, output: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            params,
            output: output.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &P {
        &self.params
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("duplicate job id in batch: {0}")]
    DuplicateId(String),
    #[error("job id must not be empty (position {0})")]
    EmptyId(usize),
}

/// Ordered jobs with unique ids.
#[derive(Debug, Clone)]
pub struct JobSet<P> {
    jobs: Vec<JobDescriptor<P>>,
}

impl<P> JobSet<P> {
    pub fn new(jobs: Vec<JobDescriptor<P>>) -> Result<Self, ManifestError> {
        let mut seen = HashSet::new();
        for (idx, job) in jobs.iter().enumerate() {
            if job.id.trim().is_empty() {
                return Err(ManifestError::EmptyId(idx + 1));
            }
            if !seen.insert(job.id.as_str()) {
                return Err(ManifestError::DuplicateId(job.id.clone()));
            }
        }
        Ok(Self { jobs })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobDescriptor<P>> {
        self.jobs.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageParams {
    pub prompt: String,
    pub aspect_ratio: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoParams {
    pub prompt: String,
    pub aspect_ratio: String,
    pub resolution: String,
    pub duration_seconds: u32,
    pub start_frame: Option<PathBuf>,
    pub negative_prompt: Option<String>,
}

fn default_aspect_ratio() -> String {
    "16:9".to_string()
}

fn default_square() -> String {
    "1:1".to_string()
}

fn default_resolution() -> String {
    "720p".to_string()
}

fn default_duration() -> u32 {
    8
}

fn default_image_model() -> String {
    DEFAULT_IMAGE_MODEL.to_string()
}

fn default_video_model() -> String {
    DEFAULT_VIDEO_MODEL.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageJobSpec {
    pub id: String,
    #[serde(default = "default_square")]
    pub aspect_ratio: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageManifest {
    pub output_dir: PathBuf,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default)]
    pub references: Vec<PathBuf>,
    #[serde(default)]
    pub policy: RetryPolicy,
    pub jobs: Vec<ImageJobSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoJobSpec {
    pub id: String,
    #[serde(default)]
    pub start_frame: Option<PathBuf>,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default = "default_duration")]
    pub duration_seconds: u32,
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoManifest {
    pub output_dir: PathBuf,
    /// Directory that relative `start_frame` names are looked up in.
    #[serde(default)]
    pub frames_dir: Option<PathBuf>,
    #[serde(default = "default_video_model")]
    pub model: String,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub style_guide: Option<String>,
    /// Seconds between operation status checks.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    /// Give up on a single operation after this many seconds.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
    #[serde(default)]
    pub policy: RetryPolicy,
    pub jobs: Vec<VideoJobSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Manifest {
    Image(ImageManifest),
    Video(VideoManifest),
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

impl ImageManifest {
    pub fn reference_paths(&self, root: &Path) -> Vec<PathBuf> {
        self.references.iter().map(|p| resolve(root, p)).collect()
    }

    pub fn job_set(&self, root: &Path) -> Result<JobSet<ImageParams>, ManifestError> {
        let out_dir = resolve(root, &self.output_dir);
        let jobs = self
            .jobs
            .iter()
            .map(|spec| {
                JobDescriptor::new(
                    spec.id.clone(),
                    ImageParams {
                        prompt: spec.prompt.clone(),
                        aspect_ratio: spec.aspect_ratio.clone(),
                    },
                    out_dir.join(&spec.id),
                )
            })
            .collect();
        JobSet::new(jobs)
    }
}

impl VideoManifest {
    fn full_prompt(&self, prompt: &str) -> String {
        match self.style_guide.as_deref().map(str::trim) {
            Some(guide) if !guide.is_empty() => format!("{}\n\n{}", prompt.trim_end(), guide),
            _ => prompt.to_string(),
        }
    }

    pub fn job_set(&self, root: &Path) -> Result<JobSet<VideoParams>, ManifestError> {
        let out_dir = resolve(root, &self.output_dir);
        let frames_dir = self
            .frames_dir
            .as_deref()
            .map(|d| resolve(root, d))
            .unwrap_or_else(|| root.to_path_buf());

        let jobs = self
            .jobs
            .iter()
            .map(|spec| {
                JobDescriptor::new(
                    spec.id.clone(),
                    VideoParams {
                        prompt: self.full_prompt(&spec.prompt),
                        aspect_ratio: spec.aspect_ratio.clone(),
                        resolution: spec
                            .resolution
                            .clone()
                            .unwrap_or_else(|| self.resolution.clone()),
                        duration_seconds: spec.duration_seconds,
                        start_frame: spec.start_frame.as_deref().map(|f| resolve(&frames_dir, f)),
                        negative_prompt: self.negative_prompt.clone(),
                    },
                    out_dir.join(format!("{}.mp4", spec.id)),
                )
            })
            .collect();
        JobSet::new(jobs)
    }
}

impl Manifest {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).with_context(|| "Failed to parse batch manifest JSON")
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read manifest: {}", path.as_ref().display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Invalid manifest: {}", path.as_ref().display()))
    }

    pub fn policy(&self) -> &RetryPolicy {
        match self {
            Manifest::Image(m) => &m.policy,
            Manifest::Video(m) => &m.policy,
        }
    }
}

/// All `*.json` files under `dir`, sorted by path.
pub fn discover_manifests(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }

    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let path = entry.path();
        let is_json = path
            .extension()
            .and_then(OsStr::to_str)
            .map(|e| e.eq_ignore_ascii_case("json"))
            == Some(true);
        if entry.file_type().is_file() && is_json {
            out.push(path.to_path_buf());
        }
    }

    out.sort();
    Ok(out)
}
