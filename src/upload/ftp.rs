use super::uploader::{classify_io, collision_name, expired_artifacts, BackupUploader, UploadReceipt};
use super::UploadSettings;
use crate::backup::Artifact;
use crate::credentials::Credential;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const MAX_COLLISIONS: u32 = 1000;
const CHUNK: usize = 64 * 1024;

static NEXT_STAGING: AtomicU64 = AtomicU64::new(0);

struct FtpTarget {
    host: String,
    port: u16,
    remote_dir: String,
    username: String,
    password: Zeroizing<String>,
    passive: bool,
    connect_timeout: Duration,
    io_timeout: Duration,
}

/// Cancellation shared with a blocking FTP operation. Firing it closes the
/// watched data connections, which fails any write blocked on them.
#[derive(Default)]
struct Cancel {
    fired: AtomicBool,
    sockets: Mutex<Vec<TcpStream>>,
}

impl Cancel {
    fn check(&self) -> Result<()> {
        if self.fired.load(Ordering::SeqCst) {
            return Err(BackupError::Timeout("FTP operation cancelled".into()));
        }
        Ok(())
    }

    fn watch(&self, socket: &TcpStream) {
        let Ok(clone) = socket.try_clone() else {
            return;
        };
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        if self.fired.load(Ordering::SeqCst) {
            let _ = clone.shutdown(Shutdown::Both);
        } else {
            sockets.push(clone);
        }
    }

    /// Stops watching without closing anything. The watched clones would
    /// otherwise keep the data connection open past the end of a transfer.
    fn release(&self) {
        self.sockets.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn fire(&self) {
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        self.fired.store(true, Ordering::SeqCst);
        for socket in sockets.drain(..) {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

/// Fires the cancellation when the awaiting future goes away, e.g. when an
/// upload timeout drops it.
struct CancelOnDrop(Arc<Cancel>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.fire();
    }
}

/// FTP uploader. suppaftp's blocking client runs on the blocking pool; each
/// operation opens its own session.
pub struct FtpUploader {
    target: Arc<FtpTarget>,
}

impl FtpUploader {
    pub fn new(
        host: String,
        port: u16,
        remote_dir: String,
        passive: bool,
        credential: &Credential,
        settings: &UploadSettings,
    ) -> Self {
        Self {
            target: Arc::new(FtpTarget {
                host,
                port,
                remote_dir,
                username: credential.username().to_string(),
                password: Zeroizing::new(credential.secret().to_string()),
                passive,
                connect_timeout: settings.connect_timeout,
                io_timeout: settings.io_timeout,
            }),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FtpTarget, &Cancel) -> Result<T> + Send + 'static,
    {
        let target = self.target.clone();
        let cancel = Arc::new(Cancel::default());
        let _guard = CancelOnDrop(cancel.clone());
        tokio::task::spawn_blocking(move || op(&target, &cancel))
            .await
            .map_err(|e| BackupError::Upload(format!("FTP task failed: {}", e)))?
    }
}

impl FtpTarget {
    fn location(&self, file_name: &str) -> String {
        let dir = self.remote_dir.trim_matches('/');
        if dir.is_empty() {
            format!("ftp://{}:{}/{}", self.host, self.port, file_name)
        } else {
            format!("ftp://{}:{}/{}/{}", self.host, self.port, dir, file_name)
        }
    }

    fn connect(&self) -> Result<FtpStream> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| BackupError::UploadTransient(format!("cannot resolve {}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| BackupError::UploadTransient(format!("no address for {}", self.host)))?;

        let mut ftp = FtpStream::connect_timeout(addr, self.connect_timeout).map_err(classify_ftp)?;
        ftp.get_ref().set_read_timeout(Some(self.io_timeout))?;
        ftp.get_ref().set_write_timeout(Some(self.io_timeout))?;
        ftp.login(self.username.as_str(), self.password.as_str())
            .map_err(classify_ftp)?;
        ftp.set_mode(if self.passive { Mode::Passive } else { Mode::Active });
        ftp.transfer_type(FileType::Binary).map_err(classify_ftp)?;
        Ok(ftp)
    }

    /// Walks into the remote directory, creating each missing component.
    fn enter_remote_dir(&self, ftp: &mut FtpStream) -> Result<()> {
        if self.remote_dir.starts_with('/') {
            ftp.cwd("/").map_err(classify_ftp)?;
        }
        for part in self.remote_dir.split('/').filter(|p| !p.is_empty()) {
            if ftp.cwd(part).is_err() {
                debug!("Creating remote directory {}", part);
                ftp.mkdir(part).map_err(classify_ftp)?;
                ftp.cwd(part).map_err(classify_ftp)?;
            }
        }
        Ok(())
    }

    /// File names in the current remote directory. Servers that answer an
    /// empty directory with 450/550 yield an empty list.
    fn list_names(&self, ftp: &mut FtpStream) -> Result<Vec<String>> {
        match ftp.nlst(None) {
            Ok(names) => Ok(names
                .into_iter()
                .map(|n| n.rsplit('/').next().unwrap_or_default().to_string())
                .collect()),
            Err(FtpError::UnexpectedResponse(r)) if matches!(r.status.code(), 450 | 550) => Ok(Vec::new()),
            Err(e) => Err(classify_ftp(e)),
        }
    }

    fn free_name(&self, ftp: &mut FtpStream, file_name: &str) -> Result<String> {
        let taken: HashSet<String> = self.list_names(ftp)?.into_iter().collect();
        (0..=MAX_COLLISIONS)
            .map(|n| {
                if n == 0 {
                    file_name.to_string()
                } else {
                    collision_name(file_name, n)
                }
            })
            .find(|candidate| !taken.contains(candidate))
            .ok_or_else(|| BackupError::Upload(format!("no free remote name for {}", file_name)))
    }

    /// Sends `source` to `remote` and checks the stored size. Returns the
    /// verified byte count.
    fn transfer(&self, ftp: &mut FtpStream, source: &Path, remote: &str, expected: u64, cancel: &Cancel) -> Result<u64> {
        let mut reader = BufReader::new(File::open(source)?);
        let mut data = ftp.put_with_stream(remote).map_err(classify_ftp)?;
        data.get_ref().set_write_timeout(Some(self.io_timeout))?;
        cancel.watch(data.get_ref());

        let mut buffer = vec![0u8; CHUNK];
        let mut sent = 0u64;
        let copied = loop {
            if let Err(e) = cancel.check() {
                break Err(e);
            }
            let n = match reader.read(&mut buffer) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e.into()),
            };
            if let Err(e) = data.write_all(&buffer[..n]) {
                break Err(classify_io(e, "FTP data transfer failed"));
            }
            sent += n as u64;
        };
        cancel.release();
        if let Err(e) = copied {
            // closes the data connection and consumes the 426/226 reply
            let _ = ftp.finalize_put_stream(data);
            return Err(e);
        }
        data.flush().map_err(|e| classify_io(e, "FTP data transfer failed"))?;
        ftp.finalize_put_stream(data).map_err(classify_ftp)?;

        let stored = match ftp.size(remote) {
            Ok(size) => size as u64,
            Err(e) => {
                debug!("SIZE not available ({}), trusting transfer count", e);
                sent
            }
        };
        if stored != expected {
            return Err(BackupError::UploadTransient(format!(
                "remote size {} does not match artifact size {}",
                stored, expected
            )));
        }
        Ok(stored)
    }

    /// Uploads under a hidden staging name and renames it to the first free
    /// artifact name once the size is verified. The staging file is removed
    /// on every failure, including cancellation.
    fn store(&self, source: PathBuf, file_name: &str, expected: u64, cancel: &Cancel) -> Result<UploadReceipt> {
        let mut ftp = self.connect()?;
        let staging = format!(
            ".{}.{}-{}.partial",
            file_name,
            std::process::id(),
            NEXT_STAGING.fetch_add(1, Ordering::Relaxed)
        );

        let outcome = self.enter_remote_dir(&mut ftp).and_then(|()| {
            cancel.check()?;
            let stored = self.transfer(&mut ftp, &source, &staging, expected, cancel)?;
            cancel.check()?;
            let remote_name = self.free_name(&mut ftp, file_name)?;
            ftp.rename(staging.as_str(), remote_name.as_str()).map_err(classify_ftp)?;
            Ok((remote_name, stored))
        });

        let result = match outcome {
            Ok((remote_name, stored)) => Ok(UploadReceipt {
                location: self.location(&remote_name),
                bytes: stored,
            }),
            Err(e) => {
                if let Err(rm) = ftp.rm(&staging) {
                    debug!("Staging file {} not removed: {}", staging, rm);
                }
                Err(e)
            }
        };
        let _ = ftp.quit();
        result
    }

    fn prune(&self, job_id: &str, keep: usize) -> Result<usize> {
        let mut ftp = self.connect()?;
        self.enter_remote_dir(&mut ftp)?;
        let names = self.list_names(&mut ftp)?;

        let mut deleted = 0;
        for name in expired_artifacts(&names, job_id, keep) {
            match ftp.rm(&name) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete {}: {}", name, e),
            }
        }
        let _ = ftp.quit();
        Ok(deleted)
    }
}

#[async_trait]
impl BackupUploader for FtpUploader {
    async fn upload(&self, artifact: &Artifact) -> Result<UploadReceipt> {
        let source = artifact.path().to_path_buf();
        let file_name = artifact.file_name().to_string();
        let expected = artifact.size();

        let receipt = self
            .blocking(move |target, cancel| target.store(source, &file_name, expected, cancel))
            .await?;
        info!("Uploaded {} bytes to {}", receipt.bytes, receipt.location);
        Ok(receipt)
    }

    async fn test_connection(&self) -> Result<()> {
        self.blocking(|target, _| {
            let mut ftp = target.connect()?;
            target.enter_remote_dir(&mut ftp)?;
            let _ = ftp.quit();
            Ok(())
        })
        .await
    }

    async fn prune(&self, job_id: &str, keep: usize) -> Result<usize> {
        let job_id = job_id.to_string();
        self.blocking(move |target, _| target.prune(&job_id, keep)).await
    }

    fn name(&self) -> &'static str {
        "FTP"
    }
}

fn classify_ftp(err: FtpError) -> BackupError {
    match err {
        FtpError::ConnectionError(e) => BackupError::UploadTransient(format!("FTP connection error: {}", e)),
        FtpError::UnexpectedResponse(response) => {
            let message = String::from_utf8_lossy(&response.body).trim().to_string();
            classify_reply(response.status.code(), &message)
        }
        other => BackupError::Upload(format!("FTP error: {}", other)),
    }
}

/// Maps an FTP reply to the retry taxonomy. 4xx replies are transient by
/// definition; 530/532 and permission refusals are auth failures.
fn classify_reply(code: u32, message: &str) -> BackupError {
    let msg = format!("FTP {} {}", code, message);
    let lowered = message.to_lowercase();
    match code {
        530 | 532 => BackupError::UploadAuth(msg),
        550 | 553 if lowered.contains("permission") || lowered.contains("denied") => {
            BackupError::UploadAuth(msg)
        }
        400..=499 => BackupError::UploadTransient(msg),
        _ => BackupError::Upload(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader as AsyncBufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_reply_classification() {
        assert!(matches!(classify_reply(530, "Login incorrect."), BackupError::UploadAuth(_)));
        assert!(matches!(
            classify_reply(550, "backup.zip: Permission denied"),
            BackupError::UploadAuth(_)
        ));
        assert!(classify_reply(421, "Service not available").is_transient());
        assert!(classify_reply(426, "Connection closed; transfer aborted").is_transient());
        assert!(classify_reply(451, "Local error").is_transient());
        assert!(matches!(classify_reply(550, "No such file"), BackupError::Upload(_)));
        assert!(matches!(classify_reply(501, "Syntax error"), BackupError::Upload(_)));
    }

    #[test]
    fn test_location() {
        let settings = UploadSettings::from_config(&EngineConfig::default());
        let cred = Credential::new(Some("u".into()), "p");
        let nested = FtpUploader::new("ftp.local".into(), 2121, "/srv/db/".into(), true, &cred, &settings);
        assert_eq!(
            nested.target.location("a.zip"),
            "ftp://ftp.local:2121/srv/db/a.zip"
        );
        let root = FtpUploader::new("ftp.local".into(), 21, String::new(), true, &cred, &settings);
        assert_eq!(root.target.location("a.zip"), "ftp://ftp.local:21/a.zip");
    }

    /// In-memory FTP responder speaking just enough of the protocol for the
    /// uploader: passive mode, files keyed by their full path.
    #[derive(Default)]
    struct FakeFtp {
        files: Mutex<BTreeMap<String, Vec<u8>>>,
        dirs: Mutex<HashSet<String>>,
        commands: Mutex<Vec<String>>,
        size_skew: AtomicU64,
        no_size: AtomicBool,
        slow_stor: AtomicBool,
    }

    impl FakeFtp {
        fn saw(&self, verb: &str) -> bool {
            self.commands.lock().unwrap().iter().any(|c| c == verb)
        }

        fn paths(&self) -> Vec<String> {
            self.files.lock().unwrap().keys().cloned().collect()
        }
    }

    fn join(cwd: &str, name: &str) -> String {
        if cwd.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", cwd, name)
        }
    }

    async fn session(ftp: Arc<FakeFtp>, socket: tokio::net::TcpStream) {
        let (read, mut write) = socket.into_split();
        let mut lines = AsyncBufReader::new(read).lines();
        let mut cwd = String::new();
        let mut data: Option<TcpListener> = None;
        let mut rename_from: Option<String> = None;
        let _ = write.write_all(b"220 fake ftp ready\r\n").await;

        while let Ok(Some(line)) = lines.next_line().await {
            let (verb, arg) = match line.split_once(' ') {
                Some((verb, arg)) => (verb.to_string(), arg.to_string()),
                None => (line.clone(), String::new()),
            };
            ftp.commands.lock().unwrap().push(verb.clone());

            let reply = match verb.as_str() {
                "USER" => "331 password required".to_string(),
                "PASS" => "230 logged in".to_string(),
                "TYPE" => "200 type set".to_string(),
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let port = listener.local_addr().unwrap().port();
                    data = Some(listener);
                    format!("227 Entering Passive Mode (127,0,0,1,{},{})", port / 256, port % 256)
                }
                "CWD" if arg == "/" => {
                    cwd.clear();
                    "250 ok".to_string()
                }
                "CWD" => {
                    let path = join(&cwd, &arg);
                    if ftp.dirs.lock().unwrap().contains(&path) {
                        cwd = path;
                        "250 ok".to_string()
                    } else {
                        "550 no such directory".to_string()
                    }
                }
                "MKD" => {
                    ftp.dirs.lock().unwrap().insert(join(&cwd, &arg));
                    "257 created".to_string()
                }
                "STOR" => match data.take() {
                    Some(listener) => {
                        let _ = write.write_all(b"150 ok to send\r\n").await;
                        let (mut conn, _) = listener.accept().await.unwrap();
                        let mut body = Vec::new();
                        let mut chunk = vec![0u8; 256 * 1024];
                        loop {
                            match conn.read(&mut chunk).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => body.extend_from_slice(&chunk[..n]),
                            }
                            if ftp.slow_stor.load(Ordering::SeqCst) {
                                tokio::time::sleep(Duration::from_millis(5)).await;
                            }
                        }
                        ftp.files.lock().unwrap().insert(join(&cwd, &arg), body);
                        "226 transfer complete".to_string()
                    }
                    None => "425 use PASV first".to_string(),
                },
                "SIZE" if ftp.no_size.load(Ordering::SeqCst) => "502 SIZE not implemented".to_string(),
                "SIZE" => {
                    let skew = ftp.size_skew.load(Ordering::SeqCst);
                    let len = ftp.files.lock().unwrap().get(&join(&cwd, &arg)).map(|b| b.len() as u64);
                    match len {
                        Some(len) => format!("213 {}", len + skew),
                        None => "550 no such file".to_string(),
                    }
                }
                "NLST" => match data.take() {
                    Some(listener) => {
                        let prefix = join(&cwd, "");
                        let listing: String = ftp
                            .paths()
                            .iter()
                            .filter_map(|p| p.strip_prefix(&prefix))
                            .filter(|n| !n.contains('/'))
                            .map(|n| format!("{}\r\n", n))
                            .collect();
                        let _ = write.write_all(b"150 listing\r\n").await;
                        let (mut conn, _) = listener.accept().await.unwrap();
                        let _ = conn.write_all(listing.as_bytes()).await;
                        drop(conn);
                        "226 listing sent".to_string()
                    }
                    None => "425 use PASV first".to_string(),
                },
                "DELE" => match ftp.files.lock().unwrap().remove(&join(&cwd, &arg)) {
                    Some(_) => "250 deleted".to_string(),
                    None => "550 no such file".to_string(),
                },
                "RNFR" => {
                    rename_from = Some(join(&cwd, &arg));
                    "350 ready for RNTO".to_string()
                }
                "RNTO" => {
                    let mut files = ftp.files.lock().unwrap();
                    match rename_from.take().and_then(|from| files.remove(&from)) {
                        Some(body) => {
                            files.insert(join(&cwd, &arg), body);
                            "250 renamed".to_string()
                        }
                        None => "550 rename failed".to_string(),
                    }
                }
                "QUIT" => {
                    let _ = write.write_all(b"221 bye\r\n").await;
                    break;
                }
                _ => "502 not implemented".to_string(),
            };
            if write.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                break;
            }
        }
    }

    async fn start_responder() -> (u16, Arc<FakeFtp>) {
        let ftp = Arc::new(FakeFtp::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = ftp.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(session(state.clone(), socket));
            }
        });
        (port, ftp)
    }

    fn uploader(port: u16, dir: &str) -> FtpUploader {
        let settings = UploadSettings {
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(10),
            ..UploadSettings::from_config(&EngineConfig::default())
        };
        let cred = Credential::new(Some("backup".into()), "ftp-secret");
        FtpUploader::new("127.0.0.1".into(), port, dir.into(), true, &cred, &settings)
    }

    fn artifact(name: &str, contents: &[u8]) -> Artifact {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        Artifact::adopt(dir, path).unwrap()
    }

    #[tokio::test]
    async fn test_upload_creates_directories_and_keeps_bytes() {
        let (port, ftp) = start_responder().await;
        let contents = b"PK\x03\x04\r\n\x00\xff\n\rbinary".to_vec();

        let receipt = uploader(port, "srv/db")
            .upload(&artifact("app_20260101_020000.zip", &contents))
            .await
            .unwrap();

        assert_eq!(receipt.bytes, contents.len() as u64);
        assert_eq!(
            receipt.location,
            format!("ftp://127.0.0.1:{}/srv/db/app_20260101_020000.zip", port)
        );
        assert_eq!(ftp.paths(), vec!["srv/db/app_20260101_020000.zip".to_string()]);
        assert_eq!(
            ftp.files.lock().unwrap()["srv/db/app_20260101_020000.zip"],
            contents
        );
        assert!(ftp.saw("MKD"));
        assert!(ftp.saw("TYPE"));
        assert!(ftp.saw("SIZE"));
    }

    #[tokio::test]
    async fn test_existing_name_gets_suffix_without_size_support() {
        let (port, ftp) = start_responder().await;
        ftp.no_size.store(true, Ordering::SeqCst);
        ftp.dirs.lock().unwrap().insert("backups".into());
        ftp.files
            .lock()
            .unwrap()
            .insert("backups/app_20260101_020000.zip".into(), b"older".to_vec());

        let receipt = uploader(port, "backups")
            .upload(&artifact("app_20260101_020000.zip", b"newer"))
            .await
            .unwrap();

        assert!(receipt.location.ends_with("/backups/app_20260101_020000-1.zip"));
        let files = ftp.files.lock().unwrap();
        assert_eq!(files["backups/app_20260101_020000.zip"], b"older");
        assert_eq!(files["backups/app_20260101_020000-1.zip"], b"newer");
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_size_mismatch_is_transient_and_removes_upload() {
        let (port, ftp) = start_responder().await;
        ftp.size_skew.store(1, Ordering::SeqCst);

        let err = uploader(port, "")
            .upload(&artifact("app_20260101_020000.zip", b"zipdata"))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(ftp.saw("DELE"));
        assert!(ftp.paths().is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_upload_closes_transfer_and_cleans_up() {
        let (port, ftp) = start_responder().await;
        ftp.slow_stor.store(true, Ordering::SeqCst);
        let uploader = uploader(port, "srv");
        let big = artifact("app_20260101_020000.zip", &vec![1u8; 32 * 1024 * 1024]);

        let first = tokio::time::timeout(Duration::from_millis(100), uploader.upload(&big)).await;
        assert!(first.is_err());

        for _ in 0..500 {
            if ftp.saw("QUIT") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ftp.saw("DELE"));
        assert!(ftp.paths().is_empty());

        ftp.slow_stor.store(false, Ordering::SeqCst);
        let receipt = uploader.upload(&big).await.unwrap();
        assert!(receipt.location.ends_with("/srv/app_20260101_020000.zip"));
        assert_eq!(ftp.paths(), vec!["srv/app_20260101_020000.zip".to_string()]);
    }

    #[tokio::test]
    async fn test_prune_removes_oldest() {
        let (port, ftp) = start_responder().await;
        ftp.dirs.lock().unwrap().insert("b".into());
        for stamp in ["20260101_020000", "20260102_020000", "20260103_020000"] {
            ftp.files
                .lock()
                .unwrap()
                .insert(format!("b/app_{}.zip", stamp), vec![1]);
        }

        assert_eq!(uploader(port, "b").prune("app", 2).await.unwrap(), 1);
        assert_eq!(
            ftp.paths(),
            vec!["b/app_20260102_020000.zip".to_string(), "b/app_20260103_020000.zip".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = UploadSettings {
            connect_timeout: Duration::from_millis(500),
            ..UploadSettings::from_config(&EngineConfig::default())
        };
        let cred = Credential::new(Some("u".into()), "p");
        let uploader = FtpUploader::new("127.0.0.1".into(), port, String::new(), true, &cred, &settings);
        assert!(uploader.test_connection().await.unwrap_err().is_transient());
    }
}
