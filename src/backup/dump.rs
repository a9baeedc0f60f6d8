use super::artifact::Artifact;
use super::compression::compress_multiple_to_zip;
use crate::config::{BackupJob, DatabaseEngine, DatabaseServer, EngineConfig};
use crate::credentials::Credential;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::ffi::OsString;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const STDERR_TAIL_BYTES: usize = 2048;

/// Produces the artifact of one run. The real implementation shells out to
/// the engine's dump tool; tests substitute their own.
#[async_trait]
pub trait Dumper: Send + Sync {
    async fn dump(&self, job: &BackupJob, server: &DatabaseServer, credential: &Credential) -> Result<Artifact>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DumpTool {
    MysqlDump,
    PgDump,
}

impl DumpTool {
    fn for_engine(engine: &DatabaseEngine) -> Result<Self> {
        match engine {
            DatabaseEngine::MySQL => Ok(DumpTool::MysqlDump),
            DatabaseEngine::PostgreSQL => Ok(DumpTool::PgDump),
            DatabaseEngine::Unsupported(name) => Err(BackupError::UnsupportedEngine(name.clone())),
        }
    }

    fn engine_name(&self) -> &'static str {
        match self {
            DumpTool::MysqlDump => "MySQL",
            DumpTool::PgDump => "PostgreSQL",
        }
    }
}

/// Owner-only file holding the connection secret for exactly one tool
/// invocation. Its contents are zeroed before the file is unlinked, on every
/// exit path including timeouts.
struct CredentialFile {
    file: NamedTempFile,
    len: usize,
}

impl CredentialFile {
    fn create(dir: &Path, contents: &str) -> Result<Self> {
        let mut file = tempfile::Builder::new().prefix(".cred").tempfile_in(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(contents.as_bytes())?;
        file.as_file().sync_all()?;
        Ok(Self {
            file,
            len: contents.len(),
        })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Drop for CredentialFile {
    fn drop(&mut self) {
        let wipe = vec![0u8; self.len];
        let handle = self.file.as_file_mut();
        if handle.rewind().is_ok() && handle.write_all(&wipe).is_ok() {
            let _ = handle.sync_all();
        }
    }
}

fn quote_option_value(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn mysql_option_file(credential: &Credential) -> String {
    format!(
        "[client]\nuser={}\npassword={}\n",
        quote_option_value(credential.username()),
        quote_option_value(credential.secret())
    )
}

fn escape_pgpass(value: &str) -> String {
    value.replace('\\', "\\\\").replace(':', "\\:")
}

fn pgpass_line(server: &DatabaseServer, credential: &Credential) -> String {
    format!(
        "{}:{}:*:{}:{}\n",
        escape_pgpass(&server.host),
        server.port,
        escape_pgpass(credential.username()),
        escape_pgpass(credential.secret())
    )
}

fn mysqldump_args(server: &DatabaseServer, option_file: &Path, database: &str) -> Vec<OsString> {
    let mut defaults = OsString::from("--defaults-extra-file=");
    defaults.push(option_file);
    vec![
        defaults,
        format!("--host={}", server.host).into(),
        format!("--port={}", server.port).into(),
        "--protocol=TCP".into(),
        "--single-transaction".into(),
        "--routines".into(),
        "--triggers".into(),
        "--databases".into(),
        database.into(),
    ]
}

fn pg_dump_args(server: &DatabaseServer, username: &str, database: &str) -> Vec<OsString> {
    vec![
        format!("--host={}", server.host).into(),
        format!("--port={}", server.port).into(),
        format!("--username={}", username).into(),
        "--no-password".into(),
        "--format=plain".into(),
        database.into(),
    ]
}

pub struct DumpExecutor {
    mysqldump_path: PathBuf,
    pg_dump_path: PathBuf,
    max_duration: Duration,
    temp_root: PathBuf,
}

impl DumpExecutor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            mysqldump_path: config.mysqldump_path.clone(),
            pg_dump_path: config.pg_dump_path.clone(),
            max_duration: Duration::from_secs(config.dump_timeout_secs),
            temp_root: config.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Dumps every selected database, bundles the dumps into one zip and
    /// returns it. The whole run shares one deadline of `max_duration`.
    pub async fn execute(&self, job: &BackupJob, server: &DatabaseServer, credential: &Credential) -> Result<Artifact> {
        let tool = DumpTool::for_engine(&server.engine)?;
        if job.databases.is_empty() {
            return Err(BackupError::ConfigValidation(format!(
                "job '{}' has no databases selected",
                job.id
            )));
        }

        tokio::fs::create_dir_all(&self.temp_root).await?;
        let run_dir = tempfile::Builder::new()
            .prefix(&format!("job_{}_", job.id))
            .tempdir_in(&self.temp_root)?;
        let deadline = Instant::now() + self.max_duration;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

        info!(
            job = %job.id,
            engine = tool.engine_name(),
            "Dumping {} database(s) from {}:{}",
            job.databases.len(),
            server.host,
            server.port
        );

        let mut sql_files: Vec<(PathBuf, String)> = Vec::with_capacity(job.databases.len());
        for database in &job.databases {
            let sql_name = format!("{}.sql", database);
            let sql_path = run_dir.path().join(&sql_name);
            let size = self
                .dump_database(tool, server, credential, database, &sql_path, run_dir.path(), deadline)
                .await?;
            debug!(job = %job.id, "Dumped {} ({} bytes)", database, size);
            sql_files.push((sql_path, sql_name));
        }

        let zip_path = run_dir.path().join(format!("{}_{}.zip", job.id, timestamp));
        let bundle = sql_files.clone();
        let target = zip_path.clone();
        tokio::task::spawn_blocking(move || compress_multiple_to_zip(&bundle, &target))
            .await
            .map_err(|e| BackupError::Compression(format!("compression task failed: {}", e)))??;

        for (sql_path, _) in &sql_files {
            let _ = tokio::fs::remove_file(sql_path).await;
        }

        let artifact = tokio::task::spawn_blocking(move || Artifact::adopt(run_dir, zip_path))
            .await
            .map_err(|e| BackupError::Compression(format!("checksum task failed: {}", e)))??;

        info!(
            job = %job.id,
            "Artifact {} ready: {:.2} MB",
            artifact.file_name(),
            artifact.size() as f64 / 1024.0 / 1024.0
        );
        Ok(artifact)
    }

    fn tool_path(&self, tool: DumpTool) -> &Path {
        match tool {
            DumpTool::MysqlDump => &self.mysqldump_path,
            DumpTool::PgDump => &self.pg_dump_path,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dump_database(
        &self,
        tool: DumpTool,
        server: &DatabaseServer,
        credential: &Credential,
        database: &str,
        out_path: &Path,
        scratch: &Path,
        deadline: Instant,
    ) -> Result<u64> {
        if database.starts_with('-') {
            return Err(BackupError::ConfigValidation(format!(
                "refusing database name '{}'",
                database
            )));
        }

        let mut command = Command::new(self.tool_path(tool));
        let credential_file = match tool {
            DumpTool::MysqlDump => {
                let file = CredentialFile::create(scratch, &mysql_option_file(credential))?;
                command.args(mysqldump_args(server, file.path(), database));
                file
            }
            DumpTool::PgDump => {
                let file = CredentialFile::create(scratch, &pgpass_line(server, credential))?;
                command
                    .args(pg_dump_args(server, credential.username(), database))
                    .env("PGPASSFILE", file.path())
                    .env_remove("PGPASSWORD");
                file
            }
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| BackupError::Dump {
            engine: tool.engine_name().to_string(),
            exit_code: None,
            stderr_tail: format!("failed to start {}: {}", self.tool_path(tool).display(), e),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::Database("dump tool stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackupError::Database("dump tool stderr was not captured".into()))?;
        let stderr_task = tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES));

        let status = match tokio::time::timeout_at(deadline, pump(&mut child, stdout, out_path)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Dump of '{}' exceeded the maximum run duration, killing the dump tool", database);
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(BackupError::Timeout(format!(
                    "{} dump of '{}' exceeded {}s",
                    tool.engine_name(),
                    database,
                    self.max_duration.as_secs()
                )));
            }
        };
        drop(credential_file);

        let stderr_tail = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(BackupError::Dump {
                engine: tool.engine_name().to_string(),
                exit_code: status.code(),
                stderr_tail,
            });
        }

        let size = tokio::fs::metadata(out_path).await?.len();
        if size == 0 {
            return Err(BackupError::EmptyDump(database.to_string()));
        }
        Ok(size)
    }
}

#[async_trait]
impl Dumper for DumpExecutor {
    async fn dump(&self, job: &BackupJob, server: &DatabaseServer, credential: &Credential) -> Result<Artifact> {
        self.execute(job, server, credential).await
    }
}

async fn pump(child: &mut Child, mut stdout: ChildStdout, out_path: &Path) -> Result<ExitStatus> {
    let file = tokio::fs::File::create(out_path).await?;
    let mut writer = BufWriter::new(file);
    tokio::io::copy(&mut stdout, &mut writer).await?;
    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(child.wait().await?)
}

async fn read_tail(mut stderr: ChildStderr, limit: usize) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        match stderr.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buffer[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}
