//! Connection probes for servers and destinations, used by "test connection"
//! requests and as the preflight check of every run.

use crate::config::{DatabaseServer, Destination};
use crate::credentials::CredentialStore;
use crate::database::create_driver;
use crate::error::{BackupError, Result};
use crate::upload::UploaderFactory;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProbeResult {
    Reachable,
    Unreachable { reason: String },
}

impl ProbeResult {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeResult::Reachable)
    }

    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => ProbeResult::Reachable,
            Err(e) => ProbeResult::Unreachable { reason: e.to_string() },
        }
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe_server(&self, server: &DatabaseServer) -> ProbeResult;
    async fn probe_destination(&self, destination: &Destination) -> ProbeResult;
    async fn list_databases(&self, server: &DatabaseServer) -> Result<Vec<String>>;
}

pub struct ConnectionProbe {
    credentials: Arc<CredentialStore>,
    uploaders: Arc<dyn UploaderFactory>,
    timeout: Duration,
}

impl ConnectionProbe {
    pub fn new(credentials: Arc<CredentialStore>, uploaders: Arc<dyn UploaderFactory>, timeout: Duration) -> Self {
        Self {
            credentials,
            uploaders,
            timeout,
        }
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            BackupError::Timeout(format!("{} did not answer within {}s", what, self.timeout.as_secs()))
        })?
    }
}

#[async_trait]
impl Prober for ConnectionProbe {
    async fn probe_server(&self, server: &DatabaseServer) -> ProbeResult {
        let result = async {
            let credential = self.credentials.get(&server.credential_ref)?;
            let driver = create_driver(server, &credential, self.timeout)?;
            self.bounded(&format!("server '{}'", server.id), driver.test_connection())
                .await
        }
        .await;
        debug!(server = %server.id, ?result, "Server probe finished");
        ProbeResult::from_result(result)
    }

    async fn probe_destination(&self, destination: &Destination) -> ProbeResult {
        let result = async {
            let credential = match destination.credential_ref() {
                Some(id) => Some(self.credentials.get(id)?),
                None => None,
            };
            let uploader = self.uploaders.create(destination, credential)?;
            self.bounded(&format!("destination '{}'", destination.id()), uploader.test_connection())
                .await
        }
        .await;
        debug!(destination = %destination.id(), ?result, "Destination probe finished");
        ProbeResult::from_result(result)
    }

    async fn list_databases(&self, server: &DatabaseServer) -> Result<Vec<String>> {
        let credential = self.credentials.get(&server.credential_ref)?;
        let driver = create_driver(server, &credential, self.timeout)?;
        self.bounded(&format!("server '{}'", server.id), driver.list_databases())
            .await
    }
}
