use super::types::{AppConfig, BackupJob};
use crate::error::{BackupError, Result};
use std::collections::HashSet;

/// Rejects jobs that can never produce a useful run: no databases, no
/// destinations, dangling references or an unparseable schedule.
pub fn validate_job(config: &AppConfig, job: &BackupJob) -> Result<()> {
    let fail = |msg: String| -> Result<()> {
        Err(BackupError::ConfigValidation(format!("job '{}': {}", job.id, msg)))
    };

    if job.id.trim().is_empty() {
        return Err(BackupError::ConfigValidation("job id must not be empty".into()));
    }
    if job.databases.is_empty() {
        return fail("at least one database must be selected".into());
    }
    if job.destinations.is_empty() {
        return fail("at least one destination is required".into());
    }

    let mut seen = HashSet::new();
    for db in &job.databases {
        if db.trim().is_empty() {
            return fail("database names must not be empty".into());
        }
        if db.starts_with('-') {
            return fail(format!("database name '{}' must not start with '-'", db));
        }
        if !seen.insert(db.as_str()) {
            return fail(format!("database '{}' selected twice", db));
        }
    }

    if config.server(&job.server_ref).is_none() {
        return fail(format!("unknown server '{}'", job.server_ref));
    }

    let mut seen = HashSet::new();
    for dest in &job.destinations {
        if config.destination(dest).is_none() {
            return fail(format!("unknown destination '{}'", dest));
        }
        if !seen.insert(dest.as_str()) {
            return fail(format!("destination '{}' listed twice", dest));
        }
    }

    if let Some(schedule) = &job.schedule {
        if let Err(e) = schedule.check() {
            return fail(e.to_string());
        }
    }

    if job.keep_last == Some(0) {
        return fail("keep_last must be at least 1".into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseServer, Destination, Schedule};
    use std::path::PathBuf;

    fn config() -> AppConfig {
        AppConfig {
            servers: vec![DatabaseServer {
                id: "db".into(),
                credential_ref: "db".into(),
                ..DatabaseServer::default()
            }],
            destinations: vec![Destination::Local {
                id: "disk".into(),
                path: PathBuf::from("/backups"),
            }],
            ..AppConfig::default()
        }
    }

    fn job() -> BackupJob {
        BackupJob {
            id: "j".into(),
            server_ref: "db".into(),
            databases: vec!["orders".into()],
            destinations: vec!["disk".into()],
            schedule: None,
            keep_last: None,
            enabled: true,
        }
    }

    fn rejected(job: BackupJob) -> bool {
        matches!(validate_job(&config(), &job), Err(BackupError::ConfigValidation(_)))
    }

    #[test]
    fn test_valid_job() {
        assert!(validate_job(&config(), &job()).is_ok());
    }

    #[test]
    fn test_rejections() {
        assert!(rejected(BackupJob { databases: vec![], ..job() }));
        assert!(rejected(BackupJob { destinations: vec![], ..job() }));
        assert!(rejected(BackupJob { server_ref: "nope".into(), ..job() }));
        assert!(rejected(BackupJob { destinations: vec!["nope".into()], ..job() }));
        assert!(rejected(BackupJob {
            destinations: vec!["disk".into(), "disk".into()],
            ..job()
        }));
        assert!(rejected(BackupJob {
            databases: vec!["a".into(), "a".into()],
            ..job()
        }));
        assert!(rejected(BackupJob {
            schedule: Some(Schedule::Cron("every day".into())),
            ..job()
        }));
        assert!(rejected(BackupJob { keep_last: Some(0), ..job() }));
        assert!(rejected(BackupJob {
            databases: vec!["--all-databases".into()],
            ..job()
        }));
    }
}
