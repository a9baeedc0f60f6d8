use super::uploader::{classify_io, collision_name, expired_artifacts, BackupUploader, UploadReceipt};
use crate::backup::Artifact;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const MAX_COLLISIONS: u32 = 1000;

pub struct LocalUploader {
    root: PathBuf,
}

impl LocalUploader {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Moves the staged copy to the first free name. The link fails when the
    /// name is taken, so an existing file is never replaced.
    fn publish(&self, mut staged: NamedTempFile, file_name: &str) -> Result<PathBuf> {
        for n in 0..=MAX_COLLISIONS {
            let candidate = if n == 0 {
                file_name.to_string()
            } else {
                collision_name(file_name, n)
            };
            let path = self.root.join(&candidate);
            match staged.persist_noclobber(&path) {
                Ok(_) => return Ok(path),
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!("{} exists, trying next name", path.display());
                    staged = e.file;
                }
                Err(e) => return Err(classify_io(e.error, &format!("cannot create {}", path.display()))),
            }
        }
        Err(BackupError::Upload(format!(
            "no free file name for {} in {}",
            file_name,
            self.root.display()
        )))
    }

    async fn copy_into(&self, source: &Path, target: &Path, mut out: File) -> Result<u64> {
        let mut input = File::open(source)
            .await
            .map_err(|e| classify_io(e, "cannot open artifact"))?;
        let copied = tokio::io::copy(&mut input, &mut out)
            .await
            .map_err(|e| classify_io(e, &format!("copy to {} failed", target.display())))?;
        out.flush().await?;
        out.sync_all().await?;
        Ok(copied)
    }
}

#[async_trait]
impl BackupUploader for LocalUploader {
    async fn upload(&self, artifact: &Artifact) -> Result<UploadReceipt> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| classify_io(e, &format!("cannot create {}", self.root.display())))?;

        // unlinked on drop, including when the upload is cancelled mid-copy
        let staged = tempfile::Builder::new()
            .prefix(&format!(".{}.", artifact.file_name()))
            .suffix(".partial")
            .tempfile_in(&self.root)
            .map_err(|e| classify_io(e, &format!("cannot write to {}", self.root.display())))?;
        let out = staged
            .as_file()
            .try_clone()
            .map_err(|e| classify_io(e, "cannot reopen staged copy"))?;
        let copied = self.copy_into(artifact.path(), staged.path(), File::from_std(out)).await?;

        if copied != artifact.size() {
            return Err(BackupError::Upload(format!(
                "copied {} of {} bytes to {}",
                copied,
                artifact.size(),
                staged.path().display()
            )));
        }

        let target = self.publish(staged, artifact.file_name())?;
        info!("Stored backup at {}", target.display());
        Ok(UploadReceipt {
            location: target.to_string_lossy().to_string(),
            bytes: copied,
        })
    }

    async fn test_connection(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| classify_io(e, &format!("cannot create {}", self.root.display())))?;
        let probe = self.root.join(format!(".db-backup-probe-{}", std::process::id()));
        fs::write(&probe, b"probe")
            .await
            .map_err(|e| classify_io(e, &format!("{} is not writable", self.root.display())))?;
        fs::remove_file(&probe).await?;
        Ok(())
    }

    async fn prune(&self, job_id: &str, keep: usize) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        let mut deleted = 0;
        for name in expired_artifacts(&names, job_id, keep) {
            fs::remove_file(self.root.join(&name)).await?;
            debug!("Deleted old backup {}", name);
            deleted += 1;
        }
        Ok(deleted)
    }

    fn name(&self) -> &'static str {
        "Local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn artifact(name: &str, contents: &[u8]) -> Artifact {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        Artifact::adopt(dir, path).unwrap()
    }

    #[tokio::test]
    async fn test_upload_never_overwrites() {
        let target = tempdir().unwrap();
        let root = target.path().join("nested/backups");
        let uploader = LocalUploader::new(root.clone());

        let first = artifact("nightly_20260101_020000.zip", b"first");
        let second = artifact("nightly_20260101_020000.zip", b"second!");

        let a = uploader.upload(&first).await.unwrap();
        let b = uploader.upload(&second).await.unwrap();

        assert_eq!(a.bytes, 5);
        assert_eq!(b.bytes, 7);
        assert!(a.location.ends_with("nightly_20260101_020000.zip"));
        assert!(b.location.ends_with("nightly_20260101_020000-1.zip"));
        assert_eq!(std::fs::read(root.join("nightly_20260101_020000.zip")).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_cancelled_upload_leaves_nothing_behind() {
        let target = tempdir().unwrap();
        let uploader = LocalUploader::new(target.path().to_path_buf());
        let big = artifact("nightly_20260101_020000.zip", &vec![7u8; 64 * 1024 * 1024]);

        let first = tokio::time::timeout(std::time::Duration::from_millis(1), uploader.upload(&big)).await;
        if first.is_ok() {
            // copy finished inside the window; nothing was cancelled
            return;
        }
        assert_eq!(std::fs::read_dir(target.path()).unwrap().count(), 0);

        let receipt = uploader.upload(&big).await.unwrap();
        assert!(receipt.location.ends_with("nightly_20260101_020000.zip"));
        let names: Vec<(String, u64)> = std::fs::read_dir(target.path())
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.file_name().to_string_lossy().to_string(), e.metadata().unwrap().len())
            })
            .collect();
        assert_eq!(names, vec![("nightly_20260101_020000.zip".to_string(), 64 * 1024 * 1024)]);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let target = tempdir().unwrap();
        for stamp in ["20260101_020000", "20260102_020000", "20260103_020000"] {
            std::fs::write(target.path().join(format!("nightly_{}.zip", stamp)), b"x").unwrap();
        }
        std::fs::write(target.path().join("unrelated.zip"), b"x").unwrap();

        let uploader = LocalUploader::new(target.path().to_path_buf());
        assert_eq!(uploader.prune("nightly", 1).await.unwrap(), 2);
        assert!(target.path().join("nightly_20260103_020000.zip").exists());
        assert!(!target.path().join("nightly_20260101_020000.zip").exists());
        assert!(target.path().join("unrelated.zip").exists());
    }

    #[tokio::test]
    async fn test_connection_check_leaves_no_marker() {
        let target = tempdir().unwrap();
        let uploader = LocalUploader::new(target.path().join("new"));
        uploader.test_connection().await.unwrap();
        assert_eq!(std::fs::read_dir(target.path().join("new")).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_only_directory_is_an_auth_failure() {
        use std::os::unix::fs::PermissionsExt;
        let target = tempdir().unwrap();
        let root = target.path().join("locked");
        std::fs::create_dir(&root).unwrap();
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o500)).unwrap();

        // root ignores directory permissions
        if std::fs::write(root.join("check"), b"x").is_ok() {
            return;
        }

        let uploader = LocalUploader::new(root.clone());
        let err = uploader.upload(&artifact("a_20260101_000000.zip", b"x")).await.unwrap_err();
        assert!(matches!(err, BackupError::UploadAuth(_)));
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).unwrap();
    }
}
