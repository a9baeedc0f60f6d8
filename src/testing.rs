//! Fakes for the engine seams and a ready-made configuration, shared by the
//! engine, scheduler and API tests.

use crate::backup::{Artifact, BackupEngine, Dumper, RetryPolicy};
use crate::config::{AppConfig, BackupJob, DatabaseEngine, DatabaseServer, Destination, EngineConfig};
use crate::credentials::{Credential, CredentialStore, MasterKey};
use crate::error::{BackupError, Result};
use crate::ledger::RunLedger;
use crate::probe::{ProbeResult, Prober};
use crate::upload::{BackupUploader, UploadReceipt, UploaderFactory};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};
use tokio::sync::Notify;

pub struct FakeProber {
    pub reachable: bool,
    pub databases: Vec<String>,
}

impl FakeProber {
    pub fn reachable() -> Self {
        Self {
            reachable: true,
            databases: vec!["orders".into(), "billing".into()],
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            databases: vec![],
        }
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe_server(&self, _server: &DatabaseServer) -> ProbeResult {
        if self.reachable {
            ProbeResult::Reachable
        } else {
            ProbeResult::Unreachable {
                reason: "connection refused".into(),
            }
        }
    }

    async fn probe_destination(&self, _destination: &Destination) -> ProbeResult {
        ProbeResult::Reachable
    }

    async fn list_databases(&self, _server: &DatabaseServer) -> Result<Vec<String>> {
        if !self.reachable {
            return Err(BackupError::Database("connection refused".into()));
        }
        Ok(self.databases.clone())
    }
}

/// Writes a small fake archive, or fails with `EmptyDump` when `empty` is
/// set. With a `gate`, each dump waits for a notification first.
#[derive(Default)]
pub struct FakeDumper {
    pub calls: AtomicU32,
    pub empty: bool,
    pub gate: Option<Arc<Notify>>,
    pub artifact_paths: Mutex<Vec<PathBuf>>,
}

pub const FAKE_ARCHIVE: &[u8] = b"PK fake archive";

#[async_trait]
impl Dumper for FakeDumper {
    async fn dump(&self, job: &BackupJob, _server: &DatabaseServer, credential: &Credential) -> Result<Artifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(credential.secret(), "db-secret");
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.empty {
            return Err(BackupError::EmptyDump(job.databases[0].clone()));
        }
        let dir = tempdir()?;
        let path = dir.path().join(format!("{}_20260101_020000.zip", job.id));
        std::fs::write(&path, FAKE_ARCHIVE)?;
        self.artifact_paths.lock().unwrap().push(path.clone());
        Artifact::adopt(dir, path)
    }
}

/// Fails with the queued errors first, then succeeds, unless `always` is
/// set.
#[derive(Default)]
pub struct Script {
    pub failures: Mutex<VecDeque<BackupError>>,
    pub always: Option<fn() -> BackupError>,
    pub attempts: AtomicU32,
    pub prunes: AtomicU32,
}

impl Script {
    pub fn failing_first(errors: Vec<BackupError>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(errors.into()),
            ..Self::default()
        })
    }

    pub fn always(make: fn() -> BackupError) -> Arc<Self> {
        Arc::new(Self {
            always: Some(make),
            ..Self::default()
        })
    }
}

pub struct ScriptedUploader(pub Arc<Script>);

#[async_trait]
impl BackupUploader for ScriptedUploader {
    async fn upload(&self, artifact: &Artifact) -> Result<UploadReceipt> {
        self.0.attempts.fetch_add(1, Ordering::SeqCst);
        assert!(artifact.path().exists());
        if let Some(make) = self.0.always {
            return Err(make());
        }
        if let Some(err) = self.0.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(UploadReceipt {
            location: format!("fake://{}", artifact.file_name()),
            bytes: artifact.size(),
        })
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn prune(&self, _job_id: &str, _keep: usize) -> Result<usize> {
        self.0.prunes.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    fn name(&self) -> &'static str {
        "Scripted"
    }
}

/// Hands out scripted uploaders by destination id; unknown ids always
/// succeed.
#[derive(Default)]
pub struct FakeFactory {
    pub scripts: HashMap<String, Arc<Script>>,
    pub created: AtomicU32,
}

impl FakeFactory {
    pub fn with(scripts: &[(&str, Arc<Script>)]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts.iter().map(|(id, s)| (id.to_string(), s.clone())).collect(),
            ..Self::default()
        })
    }
}

impl UploaderFactory for FakeFactory {
    fn create(&self, destination: &Destination, _credential: Option<Credential>) -> Result<Box<dyn BackupUploader>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(destination.id())
            .cloned()
            .unwrap_or_else(|| Arc::new(Script::default()));
        Ok(Box::new(ScriptedUploader(script)))
    }
}

pub struct Fixture {
    _dir: TempDir,
    pub backups: PathBuf,
    pub config: AppConfig,
    pub credentials: Arc<CredentialStore>,
}

impl Fixture {
    /// Engine over the fixture config with the given fakes and immediate
    /// retries. Without a factory, real uploaders are used.
    pub fn engine(&self, dumper: Arc<FakeDumper>, prober: FakeProber, factory: Option<Arc<FakeFactory>>) -> BackupEngine {
        let mut engine = BackupEngine::new(
            Arc::new(self.config.clone()),
            self.credentials.clone(),
            Arc::new(RunLedger::in_memory(100)),
        )
        .with_dumper(dumper)
        .with_prober(Arc::new(prober))
        .with_retry_policy(RetryPolicy::immediate(3));
        if let Some(factory) = factory {
            engine = engine.with_uploaders(factory);
        }
        engine
    }
}

/// Servers `mysql` and `pg`, destinations `disk`, `azure` and `ftp`, and
/// jobs `orders` (mysql to disk), `analytics` (pg to azure and ftp) and
/// `everywhere` (mysql to all three).
pub fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let backups = dir.path().join("backups");

    let mut store = CredentialStore::in_memory(&MasterKey::generate());
    store
        .put("db-cred", &Credential::new(Some("backup".into()), "db-secret"))
        .unwrap();
    store.put("sas", &Credential::new(None, "sig=abc")).unwrap();
    store
        .put("ftp-cred", &Credential::new(Some("ftp".into()), "ftp-secret"))
        .unwrap();

    let config = AppConfig {
        servers: vec![
            DatabaseServer {
                id: "mysql".into(),
                engine: DatabaseEngine::MySQL,
                host: "db.internal".into(),
                port: 3306,
                credential_ref: "db-cred".into(),
            },
            DatabaseServer {
                id: "pg".into(),
                engine: DatabaseEngine::PostgreSQL,
                host: "pg.internal".into(),
                port: 5432,
                credential_ref: "db-cred".into(),
            },
        ],
        destinations: vec![
            Destination::Local {
                id: "disk".into(),
                path: backups.clone(),
            },
            Destination::Blob {
                id: "azure".into(),
                container_url: "https://acct.blob.core.windows.net/backups".into(),
                folder: None,
                credential_ref: "sas".into(),
            },
            Destination::Ftp {
                id: "ftp".into(),
                host: "ftp.internal".into(),
                port: 21,
                path: "backups".into(),
                credential_ref: "ftp-cred".into(),
                passive: true,
            },
        ],
        jobs: vec![
            job("orders", "mysql", &["disk"]),
            job("analytics", "pg", &["azure", "ftp"]),
            job("everywhere", "mysql", &["disk", "azure", "ftp"]),
        ],
        engine: EngineConfig::default(),
        ..AppConfig::default()
    };

    Fixture {
        _dir: dir,
        backups,
        config,
        credentials: Arc::new(store),
    }
}

pub fn job(id: &str, server: &str, destinations: &[&str]) -> BackupJob {
    BackupJob {
        id: id.into(),
        server_ref: server.into(),
        databases: vec!["orders".into()],
        destinations: destinations.iter().map(|d| d.to_string()).collect(),
        schedule: None,
        keep_last: None,
        enabled: true,
    }
}
