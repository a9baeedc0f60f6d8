use crate::error::{BackupError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Database flavour of a server. Unknown names are kept so the engine can
/// reject them at run time instead of failing the whole config load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum DatabaseEngine {
    MySQL,
    PostgreSQL,
    Unsupported(String),
}

impl From<String> for DatabaseEngine {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => DatabaseEngine::MySQL,
            "postgres" | "postgresql" => DatabaseEngine::PostgreSQL,
            _ => DatabaseEngine::Unsupported(value),
        }
    }
}

impl From<DatabaseEngine> for String {
    fn from(value: DatabaseEngine) -> Self {
        match value {
            DatabaseEngine::MySQL => "mysql".to_string(),
            DatabaseEngine::PostgreSQL => "postgresql".to_string(),
            DatabaseEngine::Unsupported(name) => name,
        }
    }
}

impl std::fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseEngine::MySQL => write!(f, "MySQL"),
            DatabaseEngine::PostgreSQL => write!(f, "PostgreSQL"),
            DatabaseEngine::Unsupported(name) => write!(f, "{}", name),
        }
    }
}

impl DatabaseEngine {
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseEngine::PostgreSQL => 5432,
            _ => 3306,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseServer {
    pub id: String,
    pub engine: DatabaseEngine,
    pub host: String,
    pub port: u16,
    pub credential_ref: String,
}

impl Default for DatabaseServer {
    fn default() -> Self {
        Self {
            id: String::new(),
            engine: DatabaseEngine::MySQL,
            host: "localhost".to_string(),
            port: 3306,
            credential_ref: String::new(),
        }
    }
}

fn default_ftp_port() -> u16 {
    21
}

fn default_true() -> bool {
    true
}

/// A place a finished artifact is copied to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Destination {
    Local {
        id: String,
        path: PathBuf,
    },
    Blob {
        id: String,
        /// Container URL without query string, e.g.
        /// `https://account.blob.core.windows.net/backups`.
        container_url: String,
        #[serde(default)]
        folder: Option<String>,
        /// Credential whose secret is the container SAS token.
        credential_ref: String,
    },
    Ftp {
        id: String,
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        #[serde(default)]
        path: String,
        credential_ref: String,
        #[serde(default = "default_true")]
        passive: bool,
    },
}

impl Destination {
    pub fn id(&self) -> &str {
        match self {
            Destination::Local { id, .. } | Destination::Blob { id, .. } | Destination::Ftp { id, .. } => id,
        }
    }

    pub fn credential_ref(&self) -> Option<&str> {
        match self {
            Destination::Local { .. } => None,
            Destination::Blob { credential_ref, .. } | Destination::Ftp { credential_ref, .. } => {
                Some(credential_ref)
            }
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Destination::Local { .. } => "local",
            Destination::Blob { .. } => "blob",
            Destination::Ftp { .. } => "ftp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Schedule {
    Minutes(u32),
    Hours(u32),
    Days(u32),
    /// Five-field cron expression: minute hour day-of-month month day-of-week.
    Cron(String),
    /// Run once at the given instant.
    Once(DateTime<Utc>),
}

impl Schedule {
    pub fn as_seconds(&self) -> Option<u64> {
        match self {
            Schedule::Minutes(n) => Some(*n as u64 * 60),
            Schedule::Hours(n) => Some(*n as u64 * 3600),
            Schedule::Days(n) => Some(*n as u64 * 86400),
            Schedule::Cron(_) | Schedule::Once(_) => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::Once(_))
    }

    pub fn check(&self) -> Result<()> {
        match self {
            Schedule::Minutes(0) | Schedule::Hours(0) | Schedule::Days(0) => Err(
                BackupError::ConfigValidation("schedule interval must be greater than zero".into()),
            ),
            Schedule::Cron(expr) => parse_cron(expr).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// First trigger strictly after `after`, or `None` when the schedule
    /// never fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Schedule::Cron(expr) => Ok(parse_cron(expr)?.after(&after).next()),
            Schedule::Once(at) => Ok((*at > after).then_some(*at)),
            interval => {
                let secs = interval.as_seconds().unwrap_or(0);
                if secs == 0 {
                    return Err(BackupError::ConfigValidation(
                        "schedule interval must be greater than zero".into(),
                    ));
                }
                Ok(Some(after + Duration::seconds(secs as i64)))
            }
        }
    }
}

fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(BackupError::ConfigValidation(format!(
            "cron expression '{}' must have 5 fields, found {}",
            expr, fields
        )));
    }
    cron::Schedule::from_str(&format!("0 {}", expr))
        .map_err(|e| BackupError::ConfigValidation(format!("invalid cron expression '{}': {}", expr, e)))
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Minutes(n) => write!(f, "Every {} minute(s)", n),
            Schedule::Hours(n) => write!(f, "Every {} hour(s)", n),
            Schedule::Days(n) => write!(f, "Every {} day(s)", n),
            Schedule::Cron(expr) => write!(f, "Cron '{}'", expr),
            Schedule::Once(at) => write!(f, "Once at {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupJob {
    pub id: String,
    pub server_ref: String,
    pub databases: Vec<String>,
    pub destinations: Vec<String>,
    /// `None` means the job only runs on manual trigger.
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Number of artifacts of this job kept per destination.
    #[serde(default)]
    pub keep_last: Option<usize>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub dump_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub blob_chunk_threshold: u64,
    pub blob_chunk_size: usize,
    pub tick_interval_secs: u64,
    pub history_limit: usize,
    pub temp_dir: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    pub credentials_path: Option<PathBuf>,
    pub mysqldump_path: PathBuf,
    pub pg_dump_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
            dump_timeout_secs: 3600,
            upload_timeout_secs: 1800,
            probe_timeout_secs: 10,
            blob_chunk_threshold: 32 * 1024 * 1024,
            blob_chunk_size: 4 * 1024 * 1024,
            tick_interval_secs: 30,
            history_limit: 500,
            temp_dir: None,
            ledger_path: None,
            credentials_path: None,
            mysqldump_path: PathBuf::from("mysqldump"),
            pg_dump_path: PathBuf::from("pg_dump"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub servers: Vec<DatabaseServer>,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub jobs: Vec<BackupJob>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub web: WebConfig,
}

impl AppConfig {
    pub fn server(&self, id: &str) -> Option<&DatabaseServer> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn destination(&self, id: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.id() == id)
    }

    pub fn job(&self, id: &str) -> Option<&BackupJob> {
        self.jobs.iter().find(|j| j.id == id)
    }
}
