use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    #[error("GEMINI_API_KEY or GOOGLE_API_KEY must be set (get a key at https://aistudio.google.com/apikey)")]
    MissingCredential,
    #[error("reference input not found: {0}")]
    MissingReference(PathBuf),
    #[error("no batch manifests found in {0}")]
    NoManifests(PathBuf),
}

/// Every reference input must exist before any job runs.
pub async fn check_references(paths: &[PathBuf]) -> Result<(), PreconditionError> {
    for path in paths {
        let is_file = fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false);
        if !is_file {
            return Err(PreconditionError::MissingReference(path.clone()));
        }
    }
    Ok(())
}

pub async fn ensure_output_dir(dir: &Path) -> Result<()> {
    if !fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        crate::logi(format!("Created directory: {}", dir.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_missing_reference_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let bus = dir.path().join("hero-bus-front.png");
        let logo = dir.path().join("logo.png");
        std::fs::write(&bus, b"png").unwrap();

        let err = check_references(&[bus.clone(), logo.clone()]).await.unwrap_err();
        assert!(matches!(err, PreconditionError::MissingReference(ref p) if *p == logo));

        std::fs::write(&logo, b"png").unwrap();
        check_references(&[bus, logo]).await.unwrap();
    }

    #[tokio::test]
    async fn creates_nested_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("public/videos");
        ensure_output_dir(&out).await.unwrap();
        assert!(out.is_dir());
        ensure_output_dir(&out).await.unwrap();
    }
}
