use crate::api::gemini::GeminiImageGenerator;
use crate::api::veo::VeoVideoGenerator;
use crate::backoff::RetryPolicy;
use crate::config::{self, Config};
use crate::init::{self, PreconditionError};
use crate::jobs::{self, ImageManifest, ImageParams, JobSet, Manifest, VideoManifest, VideoParams};
use crate::runner::{self, ArtifactStore, BatchResult, TokioSleeper};
use crate::store::FsStore;
use crate::{display_path, logi, logok, logw};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MANIFEST_DIR: &str = "jobs";

enum Batch {
    Image {
        source: PathBuf,
        manifest: ImageManifest,
        jobs: JobSet<ImageParams>,
    },
    Video {
        source: PathBuf,
        manifest: VideoManifest,
        jobs: JobSet<VideoParams>,
    },
}

impl Batch {
    fn source(&self) -> &Path {
        match self {
            Batch::Image { source, .. } | Batch::Video { source, .. } => source.as_path(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Batch::Image { .. } => "Images",
            Batch::Video { .. } => "Videos",
        }
    }

    fn len(&self) -> usize {
        match self {
            Batch::Image { jobs, .. } => jobs.len(),
            Batch::Video { jobs, .. } => jobs.len(),
        }
    }

    fn outputs(&self) -> Vec<(&str, &Path)> {
        match self {
            Batch::Image { jobs, .. } => jobs.iter().map(|j| (j.id(), j.output())).collect(),
            Batch::Video { jobs, .. } => jobs.iter().map(|j| (j.id(), j.output())).collect(),
        }
    }

    fn output_dir(&self, root: &Path) -> PathBuf {
        let dir = match self {
            Batch::Image { manifest, .. } => &manifest.output_dir,
            Batch::Video { manifest, .. } => &manifest.output_dir,
        };
        root.join(dir)
    }
}

fn manifest_paths(root: &Path, explicit: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if !explicit.is_empty() {
        return Ok(explicit
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { root.join(p) })
            .collect());
    }

    let dir = root.join(MANIFEST_DIR);
    let found = jobs::discover_manifests(&dir)?;
    if found.is_empty() {
        return Err(PreconditionError::NoManifests(dir).into());
    }
    Ok(found)
}

/// Parses every manifest and validates its job ids before anything runs.
async fn load_batches(root: &Path, explicit: &[PathBuf]) -> Result<Vec<Batch>> {
    let mut batches = Vec::new();
    for source in manifest_paths(root, explicit)? {
        let shown = display_path(root, &source);
        let batch = match Manifest::load(&source).await? {
            Manifest::Image(manifest) => {
                let jobs = manifest
                    .job_set(root)
                    .with_context(|| format!("Invalid job list in {}", shown))?;
                Batch::Image { source, manifest, jobs }
            }
            Manifest::Video(manifest) => {
                let jobs = manifest
                    .job_set(root)
                    .with_context(|| format!("Invalid job list in {}", shown))?;
                Batch::Video { source, manifest, jobs }
            }
        };
        batches.push(batch);
    }
    Ok(batches)
}

fn policy_line(policy: &RetryPolicy) -> String {
    format!(
        "max attempts {}, backoff from {}s, pause {}s/{}s",
        policy.max_attempts(),
        policy.backoff.base.as_secs(),
        policy.pacing.after_success.as_secs(),
        policy.pacing.after_failure.as_secs()
    )
}

async fn run_batch(cfg: &Config, client: &reqwest::Client, batch: &Batch) -> Result<BatchResult> {
    let root = &cfg.project_root;
    init::ensure_output_dir(&batch.output_dir(root)).await?;

    logi(format!(
        "=== {} ({} jobs) from {} ===",
        batch.label(),
        batch.len(),
        display_path(root, batch.source())
    ));

    let store = FsStore;
    let sleeper = TokioSleeper;
    let result = match batch {
        Batch::Image { manifest, jobs, .. } => {
            logi(format!("Model: {} ({})", manifest.model, policy_line(&manifest.policy)));
            let refs = manifest.reference_paths(root);
            let generator = GeminiImageGenerator::new(client.clone(), cfg, &manifest.model, &refs).await?;
            runner::run(jobs, root, &generator, &store, &sleeper, &manifest.policy).await
        }
        Batch::Video { manifest, jobs, .. } => {
            logi(format!("Model: {} ({})", manifest.model, policy_line(&manifest.policy)));
            let mut generator = VeoVideoGenerator::new(client.clone(), cfg, &manifest.model);
            if manifest.poll_interval_secs.is_some() || manifest.max_wait_secs.is_some() {
                generator = generator.with_polling(
                    manifest
                        .poll_interval_secs
                        .map(Duration::from_secs)
                        .unwrap_or(crate::api::veo::DEFAULT_POLL_INTERVAL),
                    manifest
                        .max_wait_secs
                        .map(Duration::from_secs)
                        .unwrap_or(crate::api::veo::DEFAULT_MAX_WAIT),
                );
            }
            runner::run(jobs, root, &generator, &store, &sleeper, &manifest.policy).await
        }
    };

    result.log_summary(batch.label());
    Ok(result)
}

/// Generates every job of the given manifests (or all manifests under
/// `jobs/`). Returns the process exit code: non-zero iff any job failed.
pub async fn run_generation(root: &Path, manifests: &[PathBuf]) -> Result<i32> {
    config::load_env_file(root);
    run_generation_with(root, manifests, |name| std::env::var(name).ok()).await
}

/// `run_generation` with the credential read through `lookup` instead of the
/// process environment.
pub async fn run_generation_with<F>(root: &Path, manifests: &[PathBuf], lookup: F) -> Result<i32>
where
    F: Fn(&str) -> Option<String>,
{
    let batches = load_batches(root, manifests).await?;
    let cfg = Config::resolve(root, lookup)?;

    for batch in &batches {
        if let Batch::Image { manifest, .. } = batch {
            init::check_references(&manifest.reference_paths(root)).await?;
        }
    }

    let client = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;

    let mut failed = 0usize;
    let mut generated = 0usize;
    for batch in &batches {
        let result = run_batch(&cfg, &client, batch).await?;
        failed += result.failed.len();
        generated += result.succeeded;
    }

    if failed == 0 {
        logok(format!("All done. Generated: {}", generated));
        Ok(0)
    } else {
        logw(format!("Finished with {} failed job(s). Re-run to retry them.", failed));
        Ok(1)
    }
}

/// Dry run: shows which jobs would be skipped or generated. Needs neither
/// the credential nor the network.
pub async fn plan_generation(root: &Path, manifests: &[PathBuf]) -> Result<i32> {
    let batches = load_batches(root, manifests).await?;
    let store = FsStore;

    let mut pending = 0usize;
    for batch in &batches {
        logi(format!(
            "=== {} from {} ===",
            batch.label(),
            display_path(root, batch.source())
        ));

        if let Batch::Image { manifest, .. } = batch {
            if let Err(e) = init::check_references(&manifest.reference_paths(root)).await {
                logw(format!("{}", e));
            }
        }

        let outputs = batch.outputs();
        let total = outputs.len();
        for (idx, (id, output)) in outputs.into_iter().enumerate() {
            let action = if store.exists(output).await {
                "skip"
            } else {
                pending += 1;
                "generate"
            };
            logi(format!(
                "[{}/{}] {:<8} {} -> {}",
                idx + 1,
                total,
                action,
                id,
                display_path(root, output)
            ));
        }
    }

    logi(format!("{} job(s) would be generated", pending));
    Ok(0)
}
