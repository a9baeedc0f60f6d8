use crate::backup::{BackupEngine, ScheduledJob, Scheduler};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<BackupEngine>,

    scheduler: Option<Arc<Scheduler>>,

    credentials: (String, String),

    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: Arc<BackupEngine>, scheduler: Option<Arc<Scheduler>>) -> Arc<Self> {
        let web = &engine.config().web;
        let credentials = (web.username.clone(), web.password.clone());
        Arc::new(Self {
            engine,
            scheduler,
            credentials,
            started_at: Utc::now(),
        })
    }

    /// No configured username leaves the API open.
    pub fn auth_required(&self) -> bool {
        !self.credentials.0.is_empty()
    }

    pub fn check_credentials(&self, username: &str, password: &str) -> bool {
        self.auth_required() && self.credentials.0 == username && self.credentials.1 == password
    }

    pub async fn scheduler_snapshot(&self) -> Vec<ScheduledJob> {
        match &self.scheduler {
            Some(scheduler) => scheduler.snapshot().await,
            None => Vec::new(),
        }
    }
}
