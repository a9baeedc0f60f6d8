use crate::error::{BackupError, FailureKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    PartialFailure,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::PartialFailure | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::PartialFailure => "PartialFailure",
            RunStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    Scheduled,
    Manual,
    CatchUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationStatus {
    Pending,
    Succeeded,
    Failed,
    /// Never attempted because the run stopped before the fan-out.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationOutcome {
    pub status: DestinationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

impl DestinationOutcome {
    pub fn pending() -> Self {
        Self {
            status: DestinationStatus::Pending,
            failure_kind: None,
            message: None,
            retry_count: 0,
            location: None,
            bytes: None,
        }
    }

    pub fn succeeded(location: String, bytes: u64, retry_count: u32) -> Self {
        Self {
            status: DestinationStatus::Succeeded,
            location: Some(location),
            bytes: Some(bytes),
            retry_count,
            ..Self::pending()
        }
    }

    pub fn failed(error: &BackupError, retry_count: u32) -> Self {
        Self {
            status: DestinationStatus::Failed,
            failure_kind: Some(error.kind()),
            message: Some(error.to_string()),
            retry_count,
            ..Self::pending()
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: DestinationStatus::Skipped,
            ..Self::pending()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&BackupError> for RunFailure {
    fn from(err: &BackupError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: u64,
    pub job_id: String,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub destinations: BTreeMap<String, DestinationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Sum of the per-destination retry counts.
    #[serde(default)]
    pub retry_count: u32,
}

impl RunRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Overall status from per-destination outcomes: every destination must
/// succeed for `Succeeded`, at least one for `PartialFailure`.
pub fn overall_status<'a>(outcomes: impl IntoIterator<Item = &'a DestinationOutcome>) -> RunStatus {
    let mut total = 0;
    let mut succeeded = 0;
    for outcome in outcomes {
        total += 1;
        if outcome.status == DestinationStatus::Succeeded {
            succeeded += 1;
        }
    }
    match succeeded {
        0 => RunStatus::Failed,
        n if n == total => RunStatus::Succeeded,
        _ => RunStatus::PartialFailure,
    }
}
