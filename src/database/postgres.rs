use super::driver::DatabaseDriver;
use crate::config::DatabaseServer;
use crate::credentials::Credential;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, info, warn};

const MAINTENANCE_DB: &str = "postgres";

pub struct PostgresDriver {
    config: Config,
    host: String,
    port: u16,
}

impl PostgresDriver {
    pub fn new(server: &DatabaseServer, credential: &Credential, connect_timeout: Duration) -> Self {
        let mut config = Config::new();
        config
            .host(&server.host)
            .port(server.port)
            .user(credential.username())
            .password(credential.secret())
            .dbname(MAINTENANCE_DB)
            .connect_timeout(connect_timeout);

        Self {
            config,
            host: server.host.clone(),
            port: server.port,
        }
    }

    async fn with_client<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let (client, connection) = self.config.connect(NoTls).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection closed with error: {}", e);
            }
        });
        let result = f(client).await;
        let _ = driver.await;
        result
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    async fn test_connection(&self) -> Result<()> {
        info!("Testing PostgreSQL connection to {}:{}", self.host, self.port);
        self.with_client(|client| async move {
            client.simple_query("SELECT 1").await?;
            Ok(())
        })
        .await?;
        info!("PostgreSQL connection successful");
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        debug!("Listing PostgreSQL databases on {}:{}", self.host, self.port);
        let databases = self
            .with_client(|client| async move {
                let rows = client
                    .query(
                        "SELECT datname FROM pg_database \
                         WHERE datistemplate = false AND datallowconn = true \
                         ORDER BY datname",
                        &[],
                    )
                    .await?;
                Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect::<Vec<_>>())
            })
            .await?;

        debug!("Found {} databases", databases.len());
        Ok(databases)
    }

    fn engine_name(&self) -> &'static str {
        "PostgreSQL"
    }
}
