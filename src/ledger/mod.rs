//! Run ledger: the durable history of every job run.
//!
//! Records are created `Pending`, move to `Running`, and are frozen once they
//! reach a terminal status. Readers always get a cloned snapshot, so they
//! never observe a half-applied update. Every mutation is persisted with a
//! write-to-temp-then-rename before it becomes visible.

mod record;

pub use record::{
    overall_status, DestinationOutcome, DestinationStatus, RunFailure, RunRecord, RunStatus, Trigger,
};

use crate::error::{BackupError, FailureKind, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    next_id: u64,
    runs: Vec<RunRecord>,
}

#[derive(Clone)]
struct Runs {
    next_id: u64,
    records: BTreeMap<u64, RunRecord>,
}

pub struct RunLedger {
    path: Option<PathBuf>,
    history_limit: usize,
    runs: RwLock<Runs>,
    /// Serialises persistence so the file always reflects the latest state.
    persist_lock: Mutex<()>,
}

impl RunLedger {
    /// Loads the ledger at `path`, failing any run a previous process left
    /// unfinished.
    pub fn open(path: &Path, history_limit: usize) -> Result<Self> {
        let mut file = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str::<LedgerFile>(&contents)
                .map_err(|e| BackupError::Ledger(format!("cannot parse {:?}: {}", path, e)))?
        } else {
            LedgerFile::default()
        };

        let mut recovered = 0;
        for record in file.runs.iter_mut().filter(|r| !r.is_terminal()) {
            record.status = RunStatus::Failed;
            record.finished_at = Some(Utc::now());
            record.failure = Some(RunFailure {
                kind: FailureKind::Interrupted,
                message: "process stopped before the run finished".into(),
            });
            for outcome in record.destinations.values_mut() {
                if outcome.status == DestinationStatus::Pending {
                    *outcome = DestinationOutcome::skipped();
                }
            }
            recovered += 1;
        }
        if recovered > 0 {
            warn!("Marked {} interrupted run(s) as failed", recovered);
        }

        let max_id = file.runs.iter().map(|r| r.id).max().unwrap_or(0);
        let runs = Runs {
            next_id: file.next_id.max(max_id + 1),
            records: file.runs.into_iter().map(|r| (r.id, r)).collect(),
        };
        if recovered > 0 {
            write_file(path, &snapshot(&runs)?)?;
        }

        let ledger = Self {
            path: Some(path.to_path_buf()),
            history_limit,
            runs: RwLock::new(runs),
            persist_lock: Mutex::new(()),
        };
        Ok(ledger)
    }

    pub fn in_memory(history_limit: usize) -> Self {
        Self {
            path: None,
            history_limit,
            runs: RwLock::new(Runs {
                next_id: 1,
                records: BTreeMap::new(),
            }),
            persist_lock: Mutex::new(()),
        }
    }

    /// Appends a `Pending` record with one pending entry per destination.
    pub async fn create(&self, job_id: &str, trigger: Trigger, destinations: &[String]) -> Result<u64> {
        self.mutate(|runs| {
            let id = runs.next_id;
            runs.next_id += 1;
            let record = RunRecord {
                id,
                job_id: job_id.to_string(),
                trigger,
                started_at: Utc::now(),
                finished_at: None,
                status: RunStatus::Pending,
                failure: None,
                destinations: destinations
                    .iter()
                    .map(|d| (d.clone(), DestinationOutcome::pending()))
                    .collect(),
                artifact_name: None,
                artifact_size: None,
                checksum: None,
                retry_count: 0,
            };
            runs.records.insert(id, record);
            Ok(id)
        })
        .await
    }

    pub async fn mark_running(&self, id: u64) -> Result<()> {
        self.mutate(|runs| {
            let record = record_mut(runs, id)?;
            if record.status != RunStatus::Pending {
                return Err(BackupError::Ledger(format!(
                    "run {} cannot start from {}",
                    id, record.status
                )));
            }
            record.status = RunStatus::Running;
            Ok(())
        })
        .await
    }

    pub async fn set_artifact(&self, id: u64, name: &str, size: u64, checksum: &str) -> Result<()> {
        self.mutate(|runs| {
            let record = running_mut(runs, id)?;
            record.artifact_name = Some(name.to_string());
            record.artifact_size = Some(size);
            record.checksum = Some(checksum.to_string());
            Ok(())
        })
        .await
    }

    /// Replaces the outcome of one destination in a single step.
    pub async fn set_destination(&self, id: u64, destination: &str, outcome: DestinationOutcome) -> Result<()> {
        self.mutate(|runs| {
            let record = running_mut(runs, id)?;
            let slot = record.destinations.get_mut(destination).ok_or_else(|| {
                BackupError::Ledger(format!("run {} has no destination '{}'", id, destination))
            })?;
            *slot = outcome;
            record.retry_count = record.destinations.values().map(|o| o.retry_count).sum();
            Ok(())
        })
        .await
    }

    /// Moves a run to its terminal status. Destinations that were never
    /// attempted are marked skipped.
    pub async fn finish(&self, id: u64, status: RunStatus, failure: Option<RunFailure>) -> Result<RunRecord> {
        if !status.is_terminal() {
            return Err(BackupError::Ledger(format!("{} is not a terminal status", status)));
        }
        let history_limit = self.history_limit;
        self.mutate(|runs| {
            let record = record_mut(runs, id)?;
            if record.is_terminal() {
                return Err(BackupError::Ledger(format!("run {} is already {}", id, record.status)));
            }
            record.status = status;
            record.failure = failure;
            record.finished_at = Some(Utc::now());
            for outcome in record.destinations.values_mut() {
                if outcome.status == DestinationStatus::Pending {
                    *outcome = DestinationOutcome::skipped();
                }
            }
            let finished = record.clone();
            trim_history(runs, history_limit);
            Ok(finished)
        })
        .await
    }

    pub async fn get(&self, id: u64) -> Option<RunRecord> {
        self.runs.read().await.records.get(&id).cloned()
    }

    /// Newest first, optionally for one job.
    pub async fn list(&self, job_id: Option<&str>, limit: usize) -> Vec<RunRecord> {
        let runs = self.runs.read().await;
        runs.records
            .values()
            .rev()
            .filter(|r| job_id.map_or(true, |j| r.job_id == j))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn latest_for_job(&self, job_id: &str) -> Option<RunRecord> {
        self.list(Some(job_id), 1).await.into_iter().next()
    }

    /// Applies `f` to a copy of the state and publishes the copy only after
    /// it is on disk. A failed write leaves memory as it was.
    async fn mutate<T>(&self, f: impl FnOnce(&mut Runs) -> Result<T>) -> Result<T> {
        let _persist = self.persist_lock.lock().await;
        let mut next = self.runs.read().await.clone();
        let value = f(&mut next)?;

        if let Some(path) = &self.path {
            let contents = snapshot(&next)?;
            let path = path.clone();
            tokio::task::spawn_blocking(move || write_file(&path, &contents))
                .await
                .map_err(|e| BackupError::Ledger(format!("persist task failed: {}", e)))??;
        }
        *self.runs.write().await = next;
        Ok(value)
    }
}

fn record_mut(runs: &mut Runs, id: u64) -> Result<&mut RunRecord> {
    runs.records
        .get_mut(&id)
        .ok_or_else(|| BackupError::Ledger(format!("unknown run {}", id)))
}

fn running_mut(runs: &mut Runs, id: u64) -> Result<&mut RunRecord> {
    let record = record_mut(runs, id)?;
    if record.status != RunStatus::Running {
        return Err(BackupError::Ledger(format!(
            "run {} is {} and cannot be modified",
            id, record.status
        )));
    }
    Ok(record)
}

/// Keeps every unfinished run and the newest `limit` finished ones.
fn trim_history(runs: &mut Runs, limit: usize) {
    let finished: Vec<u64> = runs
        .records
        .values()
        .filter(|r| r.is_terminal())
        .map(|r| r.id)
        .collect();
    if finished.len() <= limit {
        return;
    }
    let excess = finished.len() - limit;
    for id in finished.into_iter().take(excess) {
        runs.records.remove(&id);
    }
    debug!("Trimmed {} run(s) from history", excess);
}

fn snapshot(runs: &Runs) -> Result<String> {
    let file = LedgerFile {
        next_id: runs.next_id,
        runs: runs.records.values().cloned().collect(),
    };
    Ok(serde_json::to_string_pretty(&file)?)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
