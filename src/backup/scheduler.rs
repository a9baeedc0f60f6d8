use crate::backup::{BackupEngine, TriggerOutcome};
use crate::config::{validate_job, BackupJob, Schedule};
use crate::ledger::Trigger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Idle,
    Due,
    Running,
    /// One-shot job that has run.
    Completed,
}

/// Per-job scheduler view exposed to the status API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub schedule: String,
    pub state: JobState,
    pub next_due: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Entry {
    schedule: Schedule,
    state: JobState,
    next_due: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    catch_up: bool,
}

impl Entry {
    fn next_after(&self, job_id: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.next_after(after).unwrap_or_else(|e| {
            error!(job = %job_id, "Cannot compute next run: {}", e);
            None
        })
    }
}

/// Schedule state of every enabled, scheduled job. Time is always passed
/// in, so transitions are deterministic.
#[derive(Debug, Default)]
pub struct ScheduleTable {
    entries: BTreeMap<String, Entry>,
}

impl ScheduleTable {
    /// Builds the table from the last recorded run of each job. A recurring
    /// job that missed at least one trigger while the process was down, or a
    /// one-shot job whose time passed without a run, gets exactly one
    /// catch-up run.
    pub fn new(jobs: &[BackupJob], last_runs: &HashMap<String, DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let mut entries = BTreeMap::new();
        for job in jobs.iter().filter(|j| j.enabled) {
            let Some(schedule) = job.schedule.clone() else {
                continue;
            };
            let last_run = last_runs.get(&job.id).copied();
            let mut entry = Entry {
                schedule,
                state: JobState::Idle,
                next_due: None,
                last_run,
                catch_up: false,
            };

            match (&entry.schedule, last_run) {
                (Schedule::Once(at), Some(last)) if last >= *at => entry.state = JobState::Completed,
                (Schedule::Once(at), _) => {
                    entry.next_due = Some(*at);
                    entry.catch_up = *at <= now;
                }
                (_, Some(last)) => match entry.next_after(&job.id, last) {
                    Some(next) if next <= now => {
                        entry.next_due = Some(now);
                        entry.catch_up = true;
                    }
                    next => entry.next_due = next,
                },
                (_, None) => entry.next_due = entry.next_after(&job.id, now),
            }

            if entry.catch_up {
                info!(job = %job.id, "Missed run detected, scheduling one catch-up run");
            }
            entries.insert(job.id.clone(), entry);
        }
        Self { entries }
    }

    /// Jobs whose time has come, with the trigger to record. Running jobs
    /// are never returned.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<(String, Trigger)> {
        let mut due = Vec::new();
        for (job_id, entry) in self.entries.iter_mut() {
            if entry.state == JobState::Idle && entry.next_due.is_some_and(|t| t <= now) {
                entry.state = JobState::Due;
            }
            if entry.state == JobState::Due {
                let trigger = if entry.catch_up {
                    Trigger::CatchUp
                } else {
                    Trigger::Scheduled
                };
                due.push((job_id.clone(), trigger));
            }
        }
        due
    }

    /// The job started: compute its next trigger right away.
    pub fn mark_started(&mut self, job_id: &str, now: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(job_id) else {
            return;
        };
        entry.state = JobState::Running;
        entry.last_run = Some(now);
        entry.catch_up = false;
        entry.next_due = if entry.schedule.is_recurring() {
            entry.next_after(job_id, now)
        } else {
            None
        };
    }

    /// The trigger found the job already in flight; this occurrence is
    /// dropped and the entry follows the running job.
    pub fn mark_skipped(&mut self, job_id: &str, now: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(job_id) else {
            return;
        };
        entry.state = JobState::Running;
        entry.catch_up = false;
        if entry.schedule.is_recurring() {
            entry.next_due = entry.next_after(job_id, now);
        }
    }

    /// The run ended. A trigger that fell due while it was running is
    /// skipped, not replayed.
    pub fn mark_finished(&mut self, job_id: &str, now: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(job_id) else {
            return;
        };
        if entry.state != JobState::Running {
            return;
        }
        if !entry.schedule.is_recurring() {
            entry.state = if entry.last_run.is_some() {
                JobState::Completed
            } else {
                JobState::Idle
            };
            return;
        }
        entry.state = JobState::Idle;
        if entry.next_due.is_some_and(|t| t <= now) {
            debug!(job = %job_id, "Skipping trigger missed while running");
            entry.next_due = entry.next_after(job_id, now);
        }
    }

    pub fn running(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == JobState::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ScheduledJob> {
        self.entries
            .iter()
            .map(|(job_id, e)| ScheduledJob {
                job_id: job_id.clone(),
                schedule: e.schedule.to_string(),
                state: e.state,
                next_due: e.next_due,
                last_run: e.last_run,
            })
            .collect()
    }
}

/// Drives the schedule table against the engine on a fixed tick.
pub struct Scheduler {
    engine: Arc<BackupEngine>,
    table: RwLock<ScheduleTable>,
    tick: Duration,
}

impl Scheduler {
    pub async fn new(engine: Arc<BackupEngine>) -> Self {
        let config = engine.config();
        let mut last_runs = HashMap::new();
        for job in &config.jobs {
            if let Some(record) = engine.ledger().latest_for_job(&job.id).await {
                last_runs.insert(job.id.clone(), record.started_at);
            }
        }
        let valid: Vec<BackupJob> = config
            .jobs
            .iter()
            .filter(|job| match validate_job(config, job) {
                Ok(()) => true,
                Err(e) => {
                    warn!(job = %job.id, "Not scheduling invalid job: {}", e);
                    false
                }
            })
            .cloned()
            .collect();
        let table = ScheduleTable::new(&valid, &last_runs, Utc::now());
        let tick = Duration::from_secs(config.engine.tick_interval_secs.max(1));

        Self {
            engine,
            table: RwLock::new(table),
            tick,
        }
    }

    pub async fn snapshot(&self) -> Vec<ScheduledJob> {
        self.table.read().await.snapshot()
    }

    /// One pass: retire finished runs, then start whatever is due.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let due = {
            let mut table = self.table.write().await;
            for job_id in table.running() {
                if !self.engine.is_running(&job_id) {
                    table.mark_finished(&job_id, now);
                }
            }
            table.due(now)
        };

        for (job_id, trigger) in due {
            let outcome = self.engine.start(&job_id, trigger).await;
            let mut table = self.table.write().await;
            match outcome {
                Ok(TriggerOutcome::Started(run_id)) => {
                    info!(job = %job_id, run_id, ?trigger, "Triggered scheduled backup");
                    table.mark_started(&job_id, now);
                }
                Ok(TriggerOutcome::AlreadyRunning) => {
                    info!(job = %job_id, "Previous run still in progress, skipping this trigger");
                    table.mark_skipped(&job_id, now);
                }
                Err(e) => {
                    error!(job = %job_id, "Failed to trigger backup: {}", e);
                    table.mark_skipped(&job_id, now);
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicUsize>) {
        let jobs = self.table.read().await.entries.len();
        if jobs == 0 {
            warn!("No scheduled jobs configured; only manual runs will happen");
        }
        info!("Scheduler started with {} job(s), tick every {:?}", jobs, self.tick);

        while shutdown.load(Ordering::Relaxed) == 0 {
            self.tick(Utc::now()).await;

            select! {
                _ = sleep(self.tick) => {}
                _ = async {
                    while shutdown.load(Ordering::Relaxed) == 0 {
                        sleep(Duration::from_millis(100)).await;
                    }
                } => {}
            }
        }
        info!("Scheduler stopped");
    }
}
