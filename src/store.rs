use crate::runner::{Artifact, ArtifactStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Artifacts as plain files. Writes go through a temp file in the target
/// directory and are renamed into place.
pub struct FsStore;

async fn file_exists(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create dir {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move artifact into {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl ArtifactStore for FsStore {
    async fn exists(&self, locator: &Path) -> bool {
        file_exists(locator).await
    }

    async fn persist(&self, locator: &Path, artifact: &Artifact) -> Result<()> {
        let path: PathBuf = locator.to_path_buf();
        let bytes = artifact.bytes.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .context("Artifact write task panicked")?
    }
}
