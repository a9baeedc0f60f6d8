use crate::backup::Artifact;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Where an artifact ended up and how many bytes were stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub location: String,
    pub bytes: u64,
}

/// One storage backend. Every variant honours the same contract: store the
/// artifact without overwriting anything, report where it went, and classify
/// failures as transient, auth or terminal.
#[async_trait]
pub trait BackupUploader: Send + Sync {
    async fn upload(&self, artifact: &Artifact) -> Result<UploadReceipt>;
    async fn test_connection(&self) -> Result<()>;
    /// Deletes artifacts of `job_id` beyond the newest `keep`.
    async fn prune(&self, job_id: &str, keep: usize) -> Result<usize>;
    fn name(&self) -> &'static str;
}

/// Artifact names of `job_id` that fall outside the newest `keep`, oldest
/// last. Names look like `<job>_<YYYYmmdd_HHMMSS>[-n].zip`.
pub fn expired_artifacts(names: &[String], job_id: &str, keep: usize) -> Vec<String> {
    let prefix = format!("{}_", job_id);
    let mut owned: Vec<&String> = names
        .iter()
        .filter(|name| {
            let Some(rest) = name.strip_prefix(&prefix) else {
                return false;
            };
            let Some(rest) = rest.strip_suffix(".zip") else {
                return false;
            };
            let stamp = rest.get(..15).unwrap_or("");
            let suffix = rest.get(15..).unwrap_or("");
            NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").is_ok()
                && (suffix.is_empty()
                    || suffix
                        .strip_prefix('-')
                        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())))
        })
        .collect();
    owned.sort_by(|a, b| b.cmp(a));
    owned.into_iter().skip(keep).cloned().collect()
}

/// `name.zip` -> `name-<n>.zip`
pub fn collision_name(file_name: &str, n: u32) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}-{}.{}", stem, n, ext),
        None => format!("{}-{}", file_name, n),
    }
}

pub fn classify_io(err: std::io::Error, context: &str) -> BackupError {
    use std::io::ErrorKind;
    let msg = format!("{}: {}", context, err);
    match err.kind() {
        ErrorKind::PermissionDenied => BackupError::UploadAuth(msg),
        ErrorKind::TimedOut
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionRefused
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => BackupError::UploadTransient(msg),
        _ => BackupError::Upload(msg),
    }
}
