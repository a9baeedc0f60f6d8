mod blob;
mod ftp;
mod local;
mod uploader;

pub use blob::BlobUploader;
pub use ftp::FtpUploader;
pub use local::LocalUploader;
pub use uploader::{classify_io, collision_name, expired_artifacts, BackupUploader, UploadReceipt};

use crate::config::{Destination, EngineConfig};
use crate::credentials::Credential;
use crate::error::{BackupError, Result};
use std::time::Duration;

/// Tunables shared by the network-backed uploaders.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub blob_chunk_threshold: u64,
    pub blob_chunk_size: usize,
}

impl UploadSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.probe_timeout_secs),
            io_timeout: Duration::from_secs(config.upload_timeout_secs),
            blob_chunk_threshold: config.blob_chunk_threshold,
            blob_chunk_size: config.blob_chunk_size.max(1),
        }
    }
}

/// Builds the uploader for a destination; the engine goes through this seam
/// so tests can swap in their own backends.
pub trait UploaderFactory: Send + Sync {
    fn create(&self, destination: &Destination, credential: Option<Credential>) -> Result<Box<dyn BackupUploader>>;
}

pub struct DefaultUploaderFactory {
    settings: UploadSettings,
}

impl DefaultUploaderFactory {
    pub fn new(settings: UploadSettings) -> Self {
        Self { settings }
    }
}

impl UploaderFactory for DefaultUploaderFactory {
    fn create(&self, destination: &Destination, credential: Option<Credential>) -> Result<Box<dyn BackupUploader>> {
        create_uploader(destination, credential, &self.settings)
    }
}

pub fn create_uploader(
    destination: &Destination,
    credential: Option<Credential>,
    settings: &UploadSettings,
) -> Result<Box<dyn BackupUploader>> {
    let require = |credential: Option<Credential>| {
        credential.ok_or_else(|| {
            BackupError::Credential(format!("destination '{}' requires a credential", destination.id()))
        })
    };

    match destination {
        Destination::Local { path, .. } => Ok(Box::new(LocalUploader::new(path.clone()))),
        Destination::Blob {
            container_url, folder, ..
        } => Ok(Box::new(BlobUploader::new(
            container_url,
            folder.clone(),
            &require(credential)?,
            settings,
        )?)),
        Destination::Ftp {
            host,
            port,
            path,
            passive,
            ..
        } => Ok(Box::new(FtpUploader::new(
            host.clone(),
            *port,
            path.clone(),
            *passive,
            &require(credential)?,
            settings,
        ))),
    }
}
