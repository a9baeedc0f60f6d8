use super::compression::calculate_sha256;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// The finished dump archive of one run.
///
/// It lives in a run-private temp directory that is removed when the
/// artifact is cleaned up or dropped, whichever happens first.
#[derive(Debug)]
pub struct Artifact {
    dir: Option<TempDir>,
    path: PathBuf,
    file_name: String,
    size: u64,
    sha256: String,
}

impl Artifact {
    /// Takes ownership of `dir`; `path` must point at a file inside it.
    pub fn adopt(dir: TempDir, path: PathBuf) -> Result<Self> {
        let size = std::fs::metadata(&path)?.len();
        let sha256 = calculate_sha256(&path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "backup.zip".to_string());

        Ok(Self {
            dir: Some(dir),
            path,
            file_name,
            size,
            sha256,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn cleanup(mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            debug!("Removing run directory {}", dir.path().display());
            dir.close()?;
        }
        Ok(())
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove artifact directory: {}", e);
            }
        }
    }
}
