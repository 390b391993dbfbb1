use crate::api::expected_mime;
use crate::backoff::RetryPolicy;
use crate::jobs::{JobDescriptor, JobSet};
use crate::{display_path, logi, logok, logw};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::Path;
use std::time::Duration;

/// Generated output, ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("no artifact in response: {0}")]
    NoArtifact(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GenerateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerateError::RateLimited(_))
    }
}

#[async_trait]
pub trait Generate<P>: Send + Sync {
    async fn generate(&self, job: &JobDescriptor<P>) -> Result<Artifact, GenerateError>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn exists(&self, locator: &Path) -> bool;
    async fn persist(&self, locator: &Path, artifact: &Artifact) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// After the given (1-based) attempt was rate limited.
    Backoff { attempt: u32, delay: Duration },
    Pacing(Duration),
}

impl Wait {
    pub fn duration(&self) -> Duration {
        match self {
            Wait::Backoff { delay, .. } => *delay,
            Wait::Pacing(delay) => *delay,
        }
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn wait(&self, wait: Wait);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn wait(&self, wait: Wait) {
        let d = wait.duration();
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    RateLimitExhausted,
    NonRetryable(String),
    Persist(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Skipped,
    Succeeded { attempts: u32 },
    Failed { attempts: u32, kind: FailureKind },
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    /// Output location relative to the project root, for reporting.
    pub output: String,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: Vec<String>,
    pub records: Vec<JobRecord>,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
}

impl BatchResult {
    fn new(total: usize) -> Self {
        Self {
            total,
            succeeded: 0,
            skipped: 0,
            failed: Vec::new(),
            records: Vec::with_capacity(total),
            started_at: Local::now(),
            finished_at: None,
        }
    }

    fn record(&mut self, id: &str, output: String, outcome: JobOutcome) {
        match &outcome {
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Succeeded { .. } => self.succeeded += 1,
            JobOutcome::Failed { .. } => self.failed.push(id.to_string()),
        }
        self.records.push(JobRecord {
            id: id.to_string(),
            output,
            outcome,
        });
    }

    /// Jobs whose output is present after the run.
    pub fn completed(&self) -> usize {
        self.succeeded + self.skipped
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn log_summary(&self, label: &str) {
        let elapsed = self
            .finished_at
            .map(|end| (end - self.started_at).num_seconds())
            .unwrap_or(0);
        logi("=".repeat(50));
        logi(format!("{} complete: {}/{} present ({}s)", label, self.completed(), self.total, elapsed));
        logi(format!("  Generated: {}", self.succeeded));
        logi(format!("  Skipped:   {}", self.skipped));
        logi(format!("  Failed:    {}", self.failed.len()));
        if !self.failed.is_empty() {
            logw(format!("Failed: {}", self.failed.join(", ")));
        }
    }
}

/// The MIME type the output's extension calls for, when the artifact
/// disagrees with it.
pub fn mime_mismatch(output: &Path, artifact: &Artifact) -> Option<&'static str> {
    let expected = expected_mime(output)?;
    if artifact.mime_type.eq_ignore_ascii_case(expected) {
        None
    } else {
        Some(expected)
    }
}

async fn attempt_job<P>(
    job: &JobDescriptor<P>,
    root: &Path,
    generator: &dyn Generate<P>,
    store: &dyn ArtifactStore,
    sleeper: &dyn Sleeper,
    policy: &RetryPolicy,
) -> JobOutcome {
    let max_attempts = policy.max_attempts();
    let shown = display_path(root, job.output());

    for attempt in 1..=max_attempts {
        match generator.generate(job).await {
            Ok(artifact) => {
                if let Some(expected) = mime_mismatch(job.output(), &artifact) {
                    logw(format!(
                        "    Got {} but {} expects {}; saving as-is",
                        artifact.mime_type, shown, expected
                    ));
                }
                return match store.persist(job.output(), &artifact).await {
                    Ok(()) => JobOutcome::Succeeded { attempts: attempt },
                    Err(e) => {
                        logw(format!("    Failed to save {}: {:#}", shown, e));
                        JobOutcome::Failed {
                            attempts: attempt,
                            kind: FailureKind::Persist(format!("{:#}", e)),
                        }
                    }
                };
            }
            Err(e) if e.is_retryable() => {
                if attempt == max_attempts {
                    logw(format!("    {}; max retries exceeded for {}", e, job.id()));
                    break;
                }
                let delay = policy.backoff.delay(attempt - 1);
                logw(format!(
                    "    Rate limited (attempt {}/{}). Waiting {}s...",
                    attempt,
                    max_attempts,
                    delay.as_secs()
                ));
                sleeper.wait(Wait::Backoff { attempt, delay }).await;
            }
            Err(e) => {
                logw(format!("    Error: {:#}", e));
                return JobOutcome::Failed {
                    attempts: attempt,
                    kind: FailureKind::NonRetryable(format!("{:#}", e)),
                };
            }
        }
    }

    JobOutcome::Failed {
        attempts: max_attempts,
        kind: FailureKind::RateLimitExhausted,
    }
}

/// Runs every job in order. Never aborts early: each failure is recorded and
/// the next job still runs. Paths in log lines and records are shown
/// relative to `root`.
pub async fn run<P: Sync>(
    jobs: &JobSet<P>,
    root: &Path,
    generator: &dyn Generate<P>,
    store: &dyn ArtifactStore,
    sleeper: &dyn Sleeper,
    policy: &RetryPolicy,
) -> BatchResult {
    let total = jobs.len();
    let mut result = BatchResult::new(total);

    for (idx, job) in jobs.iter().enumerate() {
        let position = idx + 1;
        let shown = display_path(root, job.output());

        if store.exists(job.output()).await {
            logi(format!("[{}/{}] Skipping {} (already exists)", position, total, job.id()));
            result.record(job.id(), shown, JobOutcome::Skipped);
            continue;
        }

        logi(format!("[{}/{}] Generating {}...", position, total, job.id()));
        let outcome = attempt_job(job, root, generator, store, sleeper, policy).await;

        let pause = match &outcome {
            JobOutcome::Succeeded { .. } => {
                logok(format!("    Saved: {}", shown));
                policy.pacing.after_success
            }
            _ => policy.pacing.after_failure,
        };
        result.record(job.id(), shown, outcome);

        if position < total {
            sleeper.wait(Wait::Pacing(pause)).await;
        }
    }

    result.finished_at = Some(Local::now());
    result
}
