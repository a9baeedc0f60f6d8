mod types;
mod validate;

pub use types::*;
pub use validate::validate_job;

use crate::error::{BackupError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".db_backup_engine"))
        .unwrap_or_else(|| PathBuf::from(".db_backup_engine"))
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn load_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!("Config file not found at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    info!("Loading configuration from {:?}", path);
    let contents = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    for problem in config.validate() {
        warn!("{}", problem);
    }
    Ok(config)
}

pub fn save_to(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            info!("Creating config directory: {:?}", parent);
            fs::create_dir_all(parent)?;
        }
    }

    let contents = toml::to_string_pretty(config)?;
    fs::write(path, contents)?;
    info!("Configuration saved to {:?}", path);
    Ok(())
}

impl AppConfig {
    /// Directory holding the credential store, ledger and master key unless
    /// overridden in `[engine]`.
    pub fn state_dir(config_file: &Path) -> PathBuf {
        config_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn ledger_path(&self, config_file: &Path) -> PathBuf {
        self.engine
            .ledger_path
            .clone()
            .unwrap_or_else(|| Self::state_dir(config_file).join("runs.json"))
    }

    pub fn credentials_path(&self, config_file: &Path) -> PathBuf {
        self.engine
            .credentials_path
            .clone()
            .unwrap_or_else(|| Self::state_dir(config_file).join("credentials.json"))
    }

    /// Every invalid job, rendered as one message each. Invalid jobs are
    /// never scheduled.
    pub fn validate(&self) -> Vec<BackupError> {
        let mut problems = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job.id.as_str()) {
                problems.push(BackupError::ConfigValidation(format!("duplicate job id '{}'", job.id)));
            }
            if let Err(e) = validate_job(self, job) {
                problems.push(e);
            }
        }
        problems
    }

    pub fn add_job(&mut self, job: BackupJob) -> Result<()> {
        if self.job(&job.id).is_some() {
            return Err(BackupError::ConfigValidation(format!("job '{}' already exists", job.id)));
        }
        validate_job(self, &job)?;
        info!(job = %job.id, "Registered backup job");
        self.jobs.push(job);
        Ok(())
    }

    pub fn update_job(&mut self, job: BackupJob) -> Result<()> {
        validate_job(self, &job)?;
        match self.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => {
                *existing = job;
                Ok(())
            }
            None => Err(BackupError::Config(format!("job '{}' not found", job.id))),
        }
    }

    pub fn remove_job(&mut self, id: &str) -> Result<BackupJob> {
        let index = self
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| BackupError::Config(format!("job '{}' not found", id)))?;
        Ok(self.jobs.remove(index))
    }
}
