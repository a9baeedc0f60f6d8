use crate::backup::{Artifact, DumpExecutor, Dumper, RetryPolicy};
use crate::config::{validate_job, AppConfig, BackupJob, DatabaseEngine, DatabaseServer, Destination};
use crate::credentials::CredentialStore;
use crate::error::{BackupError, Result};
use crate::ledger::{overall_status, DestinationOutcome, RunFailure, RunLedger, RunRecord, RunStatus, Trigger};
use crate::probe::{ConnectionProbe, ProbeResult, Prober};
use crate::upload::{BackupUploader, DefaultUploaderFactory, UploadSettings, UploaderFactory};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "run_id", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started(u64),
    AlreadyRunning,
}

/// Holds a job's single-flight slot until dropped.
struct FlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.job_id);
    }
}

/// Runs backup jobs end to end: preflight, dump, fan-out to destinations,
/// retention and ledger bookkeeping. At most one run per job is in flight.
pub struct BackupEngine {
    config: Arc<AppConfig>,
    credentials: Arc<CredentialStore>,
    ledger: Arc<RunLedger>,
    dumper: Arc<dyn Dumper>,
    prober: Arc<dyn Prober>,
    uploaders: Arc<dyn UploaderFactory>,
    retry: RetryPolicy,
    upload_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl BackupEngine {
    pub fn new(config: Arc<AppConfig>, credentials: Arc<CredentialStore>, ledger: Arc<RunLedger>) -> Self {
        let engine = &config.engine;
        let uploaders: Arc<dyn UploaderFactory> =
            Arc::new(DefaultUploaderFactory::new(UploadSettings::from_config(engine)));
        let prober = Arc::new(ConnectionProbe::new(
            credentials.clone(),
            uploaders.clone(),
            Duration::from_secs(engine.probe_timeout_secs),
        ));

        Self {
            dumper: Arc::new(DumpExecutor::new(engine)),
            prober,
            uploaders,
            retry: RetryPolicy::from_config(engine),
            upload_timeout: Duration::from_secs(engine.upload_timeout_secs),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            config,
            credentials,
            ledger,
        }
    }

    pub fn with_dumper(mut self, dumper: Arc<dyn Dumper>) -> Self {
        self.dumper = dumper;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_uploaders(mut self, uploaders: Arc<dyn UploaderFactory>) -> Self {
        self.uploaders = uploaders;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(job_id)
    }

    /// Starts a run in the background and returns its id right away.
    pub async fn start(self: &Arc<Self>, job_id: &str, trigger: Trigger) -> Result<TriggerOutcome> {
        let Some((guard, run_id, job)) = self.begin(job_id, trigger).await? else {
            return Ok(TriggerOutcome::AlreadyRunning);
        };

        let engine = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = engine.execute(run_id, &job).await {
                error!(job = %job.id, run_id, "Run bookkeeping failed: {}", e);
            }
        });
        Ok(TriggerOutcome::Started(run_id))
    }

    /// Runs a job to completion. `None` when a run of the job is already in
    /// flight.
    pub async fn run_job(&self, job_id: &str, trigger: Trigger) -> Result<Option<RunRecord>> {
        let Some((_guard, run_id, job)) = self.begin(job_id, trigger).await? else {
            return Ok(None);
        };
        self.execute(run_id, &job).await.map(Some)
    }

    pub async fn probe_server(&self, server_id: &str) -> Result<ProbeResult> {
        Ok(self.prober.probe_server(self.server(server_id)?).await)
    }

    pub async fn probe_destination(&self, destination_id: &str) -> Result<ProbeResult> {
        let destination = self
            .config
            .destination(destination_id)
            .ok_or_else(|| BackupError::Config(format!("unknown destination '{}'", destination_id)))?;
        Ok(self.prober.probe_destination(destination).await)
    }

    pub async fn list_databases(&self, server_id: &str) -> Result<Vec<String>> {
        self.prober.list_databases(self.server(server_id)?).await
    }

    fn server(&self, server_id: &str) -> Result<&DatabaseServer> {
        self.config
            .server(server_id)
            .ok_or_else(|| BackupError::Config(format!("unknown server '{}'", server_id)))
    }

    /// Claims the single-flight slot and records the run as `Pending`.
    async fn begin(&self, job_id: &str, trigger: Trigger) -> Result<Option<(FlightGuard, u64, BackupJob)>> {
        let job = self
            .config
            .job(job_id)
            .ok_or_else(|| BackupError::Config(format!("unknown job '{}'", job_id)))?
            .clone();
        validate_job(&self.config, &job)?;

        {
            let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !set.insert(job.id.clone()) {
                info!(job = %job.id, "Run skipped: previous run still in progress");
                return Ok(None);
            }
        }
        let guard = FlightGuard {
            in_flight: self.in_flight.clone(),
            job_id: job.id.clone(),
        };

        let run_id = self.ledger.create(&job.id, trigger, &job.destinations).await?;
        Ok(Some((guard, run_id, job)))
    }

    async fn execute(&self, run_id: u64, job: &BackupJob) -> Result<RunRecord> {
        let started = Instant::now();
        self.ledger.mark_running(run_id).await?;
        info!(job = %job.id, run_id, "Backup run started");

        let (status, failure) = match self.perform(run_id, job).await {
            Ok(status) => (status, None),
            Err(e) => {
                error!(job = %job.id, run_id, "Backup run failed: {}", e);
                (RunStatus::Failed, Some(RunFailure::from(&e)))
            }
        };

        let record = self.ledger.finish(run_id, status, failure).await?;
        info!(
            job = %job.id,
            run_id,
            status = %record.status,
            retries = record.retry_count,
            "Backup run finished in {} sec",
            started.elapsed().as_secs()
        );
        Ok(record)
    }

    async fn perform(&self, run_id: u64, job: &BackupJob) -> Result<RunStatus> {
        let server = self.server(&job.server_ref)?;
        if let DatabaseEngine::Unsupported(name) = &server.engine {
            return Err(BackupError::UnsupportedEngine(name.clone()));
        }

        if let ProbeResult::Unreachable { reason } = self.prober.probe_server(server).await {
            return Err(BackupError::PreflightUnreachable(reason));
        }
        let visible = self
            .prober
            .list_databases(server)
            .await
            .map_err(|e| BackupError::PreflightUnreachable(format!("cannot list databases: {}", e)))?;
        let missing: Vec<&str> = job
            .databases
            .iter()
            .filter(|db| !visible.contains(db))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(BackupError::ConfigValidation(format!(
                "databases not found on server '{}': {}",
                server.id,
                missing.join(", ")
            )));
        }

        let artifact = {
            let credential = self.credentials.get(&server.credential_ref)?;
            self.dumper.dump(job, server, &credential).await?
        };
        info!(
            job = %job.id,
            run_id,
            "Artifact {} ready ({:.2} MB)",
            artifact.file_name(),
            artifact.size() as f64 / 1024.0 / 1024.0
        );
        self.ledger
            .set_artifact(run_id, artifact.file_name(), artifact.size(), artifact.sha256())
            .await?;

        let outcomes = self.fan_out(run_id, job, &artifact).await;
        if let Err(e) = artifact.cleanup() {
            warn!(job = %job.id, run_id, "Failed to remove artifact: {}", e);
        }
        Ok(overall_status(outcomes.iter()))
    }

    /// Delivers the artifact to every destination concurrently. Each result
    /// reaches the ledger once that destination is fully resolved.
    async fn fan_out(&self, run_id: u64, job: &BackupJob, artifact: &Artifact) -> Vec<DestinationOutcome> {
        let attempts = job.destinations.iter().map(|dest_id| async move {
            let outcome = self.deliver(dest_id, job, artifact).await;
            if let Err(e) = self.ledger.set_destination(run_id, dest_id, outcome.clone()).await {
                error!(run_id, destination = %dest_id, "Failed to record outcome: {}", e);
            }
            outcome
        });
        join_all(attempts).await
    }

    async fn deliver(&self, dest_id: &str, job: &BackupJob, artifact: &Artifact) -> DestinationOutcome {
        let uploader = match self.uploader_for(dest_id) {
            Ok(uploader) => uploader,
            Err(e) => {
                error!(destination = %dest_id, "Cannot prepare destination: {}", e);
                return DestinationOutcome::failed(&e, 0);
            }
        };

        let mut retries = 0;
        loop {
            let attempt = tokio::time::timeout(self.upload_timeout, uploader.upload(artifact))
                .await
                .unwrap_or_else(|_| {
                    Err(BackupError::Timeout(format!(
                        "upload to '{}' exceeded {}s",
                        dest_id,
                        self.upload_timeout.as_secs()
                    )))
                });

            match attempt {
                Ok(receipt) => {
                    info!(destination = %dest_id, retries, "Uploaded to {}", receipt.location);
                    if let Some(keep) = job.keep_last {
                        self.apply_retention(uploader.as_ref(), dest_id, &job.id, keep).await;
                    }
                    return DestinationOutcome::succeeded(receipt.location, receipt.bytes, retries);
                }
                Err(e) if e.is_transient() && self.retry.should_retry(retries) => {
                    let delay = self.retry.delay_for(retries);
                    warn!(
                        destination = %dest_id,
                        "Upload attempt {} failed: {}. Retrying in {:?}",
                        retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => {
                    error!(destination = %dest_id, retries, "Upload failed: {}", e);
                    return DestinationOutcome::failed(&e, retries);
                }
            }
        }
    }

    fn uploader_for(&self, dest_id: &str) -> Result<Box<dyn BackupUploader>> {
        let destination: &Destination = self
            .config
            .destination(dest_id)
            .ok_or_else(|| BackupError::ConfigValidation(format!("unknown destination '{}'", dest_id)))?;
        let credential = match destination.credential_ref() {
            Some(id) => Some(self.credentials.get(id)?),
            None => None,
        };
        self.uploaders.create(destination, credential)
    }

    async fn apply_retention(&self, uploader: &dyn BackupUploader, dest_id: &str, job_id: &str, keep: usize) {
        match tokio::time::timeout(self.upload_timeout, uploader.prune(job_id, keep)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!(destination = %dest_id, "Retention removed {} old backup(s)", n),
            Ok(Err(e)) => warn!(destination = %dest_id, "Retention failed: {}", e),
            Err(_) => warn!(destination = %dest_id, "Retention timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseEngine;
    use crate::credentials::Credential;
    use crate::error::FailureKind;
    use crate::ledger::DestinationStatus;
    use crate::testing::{fixture, job, FakeDumper, FakeFactory, FakeProber, Script};
    use crate::upload::UploadReceipt;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn timeout_error() -> BackupError {
        BackupError::Timeout("network timeout".into())
    }

    fn auth_error() -> BackupError {
        BackupError::UploadAuth("HTTP 403".into())
    }

    fn transient_error() -> BackupError {
        BackupError::UploadTransient("connection reset".into())
    }

    #[tokio::test]
    async fn test_mysql_to_local_succeeds() {
        let fx = fixture();
        let dumper = Arc::new(FakeDumper::default());
        let engine = fx.engine(dumper.clone(), FakeProber::reachable(), None);

        let record = engine.run_job("orders", Trigger::Manual).await.unwrap().unwrap();

        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.destinations.len(), 1);
        assert_eq!(record.artifact_size, Some(15));
        assert!(record.checksum.is_some());
        assert!(fx.backups.join("orders_20260101_020000.zip").exists());
        // the artifact is gone once every destination was attempted
        assert!(!dumper.artifact_paths.lock().unwrap()[0].exists());
        assert!(!engine.is_running("orders"));
    }

    #[tokio::test]
    async fn test_blob_retries_timeouts_then_succeeds() {
        let fx = fixture();
        let blob = Script::failing_first(vec![timeout_error(), timeout_error()]);
        let ftp = Script::failing_first(vec![]);
        let factory = FakeFactory::with(&[("azure", blob.clone()), ("ftp", ftp.clone())]);
        let engine = fx.engine(Arc::new(FakeDumper::default()), FakeProber::reachable(), Some(factory));

        let record = engine.run_job("analytics", Trigger::Scheduled).await.unwrap().unwrap();

        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.destinations["azure"].retry_count, 2);
        assert_eq!(record.destinations["ftp"].retry_count, 0);
        assert_eq!(record.retry_count, 2);
        assert_eq!(blob.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(ftp.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_every_destination() {
        let fx = fixture();
        let dumper = Arc::new(FakeDumper::default());
        let factory = FakeFactory::with(&[("azure", Script::always(auth_error))]);
        let engine = fx.engine(dumper.clone(), FakeProber::reachable(), Some(factory));

        let record = engine.run_job("everywhere", Trigger::Manual).await.unwrap().unwrap();

        assert_eq!(record.status, RunStatus::PartialFailure);
        assert_eq!(record.destinations.len(), 3);
        let azure = &record.destinations["azure"];
        assert_eq!(azure.status, DestinationStatus::Failed);
        assert_eq!(azure.failure_kind, Some(FailureKind::UploadAuthError));
        assert_eq!(azure.message.as_deref(), Some(auth_error().to_string().as_str()));
        assert_eq!(record.destinations["disk"].status, DestinationStatus::Succeeded);
        assert_eq!(record.destinations["ftp"].status, DestinationStatus::Succeeded);
        assert!(!dumper.artifact_paths.lock().unwrap()[0].exists());
    }

    #[tokio::test]
    async fn test_retry_bounds() {
        let fx = fixture();
        let auth = Script::always(auth_error);
        let flaky = Script::always(transient_error);
        let factory = FakeFactory::with(&[("azure", auth.clone()), ("ftp", flaky.clone())]);
        let engine = fx.engine(Arc::new(FakeDumper::default()), FakeProber::reachable(), Some(factory));

        let record = engine.run_job("analytics", Trigger::Manual).await.unwrap().unwrap();

        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(auth.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(record.destinations["azure"].retry_count, 0);
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(record.destinations["ftp"].retry_count, 3);
        assert_eq!(
            record.destinations["ftp"].failure_kind,
            Some(FailureKind::UploadTransientError)
        );
    }

    #[tokio::test]
    async fn test_slow_upload_times_out_and_is_retried() {
        struct Slow(AtomicU32);

        #[async_trait]
        impl BackupUploader for Slow {
            async fn upload(&self, artifact: &Artifact) -> Result<UploadReceipt> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(UploadReceipt {
                    location: "slow://ok".into(),
                    bytes: artifact.size(),
                })
            }
            async fn test_connection(&self) -> Result<()> {
                Ok(())
            }
            async fn prune(&self, _job_id: &str, _keep: usize) -> Result<usize> {
                Ok(0)
            }
            fn name(&self) -> &'static str {
                "Slow"
            }
        }

        struct SlowFactory;
        impl UploaderFactory for SlowFactory {
            fn create(&self, _d: &Destination, _c: Option<Credential>) -> Result<Box<dyn BackupUploader>> {
                Ok(Box::new(Slow(AtomicU32::new(0))))
            }
        }

        let fx = fixture();
        let engine = fx.engine(Arc::new(FakeDumper::default()), FakeProber::reachable(), None)
            .with_uploaders(Arc::new(SlowFactory))
            .with_upload_timeout(Duration::from_millis(100));

        let record = engine.run_job("orders", Trigger::Manual).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.destinations["disk"].retry_count, 1);
    }

    #[tokio::test]
    async fn test_preflight_failure_short_circuits() {
        let fx = fixture();
        let dumper = Arc::new(FakeDumper::default());
        let factory = Arc::new(FakeFactory::default());
        let engine = fx.engine(dumper.clone(), FakeProber::unreachable(), Some(factory.clone()));

        let record = engine.run_job("everywhere", Trigger::Scheduled).await.unwrap().unwrap();

        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.failure.unwrap().kind, FailureKind::PreflightUnreachable);
        assert_eq!(dumper.calls.load(Ordering::SeqCst), 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert!(record
            .destinations
            .values()
            .all(|d| d.status == DestinationStatus::Skipped));
    }

    #[tokio::test]
    async fn test_empty_dump_fails_the_run() {
        let fx = fixture();
        let dumper = Arc::new(FakeDumper {
            empty: true,
            ..FakeDumper::default()
        });
        let factory = Arc::new(FakeFactory::default());
        let engine = fx.engine(dumper, FakeProber::reachable(), Some(factory.clone()));

        let record = engine.run_job("orders", Trigger::Manual).await.unwrap().unwrap();

        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.failure.unwrap().kind, FailureKind::EmptyDumpError);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_database_fails_before_dump() {
        let fx = fixture();
        let dumper = Arc::new(FakeDumper::default());
        let prober = FakeProber {
            reachable: true,
            databases: vec!["billing".into()],
        };
        let engine = fx.engine(dumper.clone(), prober, None);

        let record = engine.run_job("orders", Trigger::Manual).await.unwrap().unwrap();

        assert_eq!(record.failure.unwrap().kind, FailureKind::ConfigValidationError);
        assert_eq!(dumper.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_engine_and_invalid_jobs() {
        let mut fx = fixture();
        fx.config.servers.push(DatabaseServer {
            id: "oracle".into(),
            engine: DatabaseEngine::Unsupported("oracle".into()),
            host: "legacy".into(),
            port: 1521,
            credential_ref: "db-cred".into(),
        });
        fx.config.jobs.push(job("legacy", "oracle", &["disk"]));
        fx.config.jobs.push(job("nowhere", "mysql", &[]));
        let dumper = Arc::new(FakeDumper::default());
        let engine = fx.engine(dumper.clone(), FakeProber::reachable(), None);

        let record = engine.run_job("legacy", Trigger::Manual).await.unwrap().unwrap();
        assert_eq!(record.failure.unwrap().kind, FailureKind::UnsupportedEngine);

        let err = engine.run_job("nowhere", Trigger::Manual).await.unwrap_err();
        assert!(matches!(err, BackupError::ConfigValidation(_)));
        assert!(engine.ledger().latest_for_job("nowhere").await.is_none());
        assert!(engine.run_job("ghost", Trigger::Manual).await.is_err());
        assert_eq!(dumper.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let fx = fixture();
        let gate = Arc::new(Notify::new());
        let dumper = Arc::new(FakeDumper {
            gate: Some(gate.clone()),
            ..FakeDumper::default()
        });
        let engine = Arc::new(fx.engine(dumper.clone(), FakeProber::reachable(), None));

        let first = engine.start("orders", Trigger::Scheduled).await.unwrap();
        let TriggerOutcome::Started(run_id) = first else {
            panic!("first trigger should start a run");
        };
        assert!(engine.is_running("orders"));

        assert_eq!(
            engine.start("orders", Trigger::Manual).await.unwrap(),
            TriggerOutcome::AlreadyRunning
        );
        assert!(engine.run_job("orders", Trigger::Manual).await.unwrap().is_none());
        assert_eq!(engine.ledger().list(Some("orders"), 10).await.len(), 1);

        // other jobs are not blocked
        assert!(!engine.is_running("everywhere"));

        gate.notify_one();
        let mut record = engine.ledger().get(run_id).await.unwrap();
        for _ in 0..200 {
            if record.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            record = engine.ledger().get(run_id).await.unwrap();
        }
        assert_eq!(record.status, RunStatus::Succeeded);
        for _ in 0..200 {
            if !engine.is_running("orders") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!engine.is_running("orders"));
        assert_eq!(dumper.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retention_runs_after_success() {
        let mut fx = fixture();
        fx.config.jobs[2].keep_last = Some(5);
        let azure = Script::failing_first(vec![]);
        let ftp = Script::always(auth_error);
        let factory = FakeFactory::with(&[("azure", azure.clone()), ("ftp", ftp.clone())]);
        let engine = fx.engine(Arc::new(FakeDumper::default()), FakeProber::reachable(), Some(factory));

        engine.run_job("everywhere", Trigger::Manual).await.unwrap().unwrap();
        assert_eq!(azure.prunes.load(Ordering::SeqCst), 1);
        assert_eq!(ftp.prunes.load(Ordering::SeqCst), 0);
    }
}
