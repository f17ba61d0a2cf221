use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Where a raw payload ended up in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPayload {
    pub digest: String,
    /// Path under the archive root: `job_<id>/page_<nnn>/<source>/<digest>.<ext>`.
    pub relative_path: PathBuf,
    pub path: PathBuf,
    pub size: usize,
    /// The same bytes were already archived at this path.
    pub reused: bool,
}

/// Content-addressed archive of raw extraction payloads, one directory per job page and
/// source. Files are never rewritten once present.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn layout(
        job_id: i64,
        page_number: u32,
        source_id: &str,
        digest: &str,
        extension: &str,
    ) -> PathBuf {
        let extension = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        [
            format!("job_{job_id}"),
            format!("page_{page_number:03}"),
            source_id.to_string(),
            format!("{digest}.{extension}"),
        ]
        .iter()
        .collect()
    }

    pub async fn store_bytes(
        &self,
        job_id: i64,
        page_number: u32,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<ArchivedPayload> {
        let digest = Self::digest(bytes);
        let relative_path = Self::layout(job_id, page_number, source_id, &digest, extension);
        let path = self.root.join(&relative_path);

        let reused = !write_once(&path, bytes).await?;
        debug!(job_id, page_number, source_id, reused, "payload archived");
        Ok(ArchivedPayload {
            digest,
            relative_path,
            path,
            size: bytes.len(),
            reused,
        })
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so readers never see
/// a partial file. Returns `false` when the path already existed.
async fn write_once(path: &Path, bytes: &[u8]) -> Result<bool> {
    if fs::try_exists(path)
        .await
        .with_context(|| format!("probing {}", path.display()))?
    {
        return Ok(false);
    }
    let dir = path.parent().context("archive path has no parent directory")?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let staging = dir.join(format!(".{}.partial", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staging)
        .await
        .with_context(|| format!("creating {}", staging.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", staging.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", staging.display()))?;
    drop(file);

    match fs::rename(&staging, path).await {
        Ok(()) => Ok(true),
        Err(err) => {
            let _ = fs::remove_file(&staging).await;
            if err.kind() == ErrorKind::AlreadyExists {
                Ok(false)
            } else {
                Err(err).with_context(|| format!("moving payload into {}", path.display()))
            }
        }
    }
}
