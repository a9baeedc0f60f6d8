use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum BackupError {
    Config(String),
    ConfigValidation(String),
    Database(String),
    Credential(String),
    PreflightUnreachable(String),
    UnsupportedEngine(String),
    Dump {
        engine: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },
    EmptyDump(String),
    Timeout(String),
    Compression(String),
    UploadTransient(String),
    UploadAuth(String),
    Upload(String),
    Ledger(String),
    Io(io::Error),
    Serialization(String),
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BackupError::ConfigValidation(msg) => write!(f, "Invalid job configuration: {}", msg),
            BackupError::Database(msg) => write!(f, "Database error: {}", msg),
            BackupError::Credential(msg) => write!(f, "Credential error: {}", msg),
            BackupError::PreflightUnreachable(msg) => write!(f, "Preflight check failed: {}", msg),
            BackupError::UnsupportedEngine(engine) => write!(f, "Unsupported database engine: {}", engine),
            BackupError::Dump {
                engine,
                exit_code,
                stderr_tail,
            } => match exit_code {
                Some(code) => write!(f, "{} dump exited with status {}: {}", engine, code, stderr_tail),
                None => write!(f, "{} dump terminated by signal: {}", engine, stderr_tail),
            },
            BackupError::EmptyDump(db) => write!(f, "Dump of database '{}' produced no output", db),
            BackupError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            BackupError::Compression(msg) => write!(f, "Compression error: {}", msg),
            BackupError::UploadTransient(msg) => write!(f, "Upload error (transient): {}", msg),
            BackupError::UploadAuth(msg) => write!(f, "Upload rejected: {}", msg),
            BackupError::Upload(msg) => write!(f, "Upload error: {}", msg),
            BackupError::Ledger(msg) => write!(f, "Run ledger error: {}", msg),
            BackupError::Io(err) => write!(f, "IO error: {}", err),
            BackupError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for BackupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackupError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Failure classification stored on run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    PreflightUnreachable,
    UnsupportedEngine,
    DumpError,
    EmptyDumpError,
    TimeoutError,
    UploadTransientError,
    UploadAuthError,
    UploadError,
    ConfigValidationError,
    CredentialError,
    Interrupted,
    InternalError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::PreflightUnreachable => "PreflightUnreachable",
            FailureKind::UnsupportedEngine => "UnsupportedEngine",
            FailureKind::DumpError => "DumpError",
            FailureKind::EmptyDumpError => "EmptyDumpError",
            FailureKind::TimeoutError => "TimeoutError",
            FailureKind::UploadTransientError => "UploadTransientError",
            FailureKind::UploadAuthError => "UploadAuthError",
            FailureKind::UploadError => "UploadError",
            FailureKind::ConfigValidationError => "ConfigValidationError",
            FailureKind::CredentialError => "CredentialError",
            FailureKind::Interrupted => "Interrupted",
            FailureKind::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

impl BackupError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BackupError::PreflightUnreachable(_) => FailureKind::PreflightUnreachable,
            BackupError::UnsupportedEngine(_) => FailureKind::UnsupportedEngine,
            BackupError::Dump { .. } => FailureKind::DumpError,
            BackupError::EmptyDump(_) => FailureKind::EmptyDumpError,
            BackupError::Timeout(_) => FailureKind::TimeoutError,
            BackupError::UploadTransient(_) => FailureKind::UploadTransientError,
            BackupError::UploadAuth(_) => FailureKind::UploadAuthError,
            BackupError::Upload(_) => FailureKind::UploadError,
            BackupError::ConfigValidation(_) => FailureKind::ConfigValidationError,
            BackupError::Credential(_) => FailureKind::CredentialError,
            _ => FailureKind::InternalError,
        }
    }

    /// Whether a destination attempt failing with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackupError::UploadTransient(_) | BackupError::Timeout(_))
    }
}

impl From<io::Error> for BackupError {
    fn from(err: io::Error) -> Self {
        BackupError::Io(err)
    }
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for BackupError {
    fn from(err: toml::ser::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<mysql_async::Error> for BackupError {
    fn from(err: mysql_async::Error) -> Self {
        BackupError::Database(err.to_string())
    }
}

impl From<tokio_postgres::Error> for BackupError {
    fn from(err: tokio_postgres::Error) -> Self {
        BackupError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(err: reqwest::Error) -> Self {
        // URLs may carry SAS tokens
        let err = err.without_url();
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            BackupError::UploadTransient(err.to_string())
        } else {
            BackupError::Upload(err.to_string())
        }
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(err: zip::result::ZipError) -> Self {
        BackupError::Compression(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
