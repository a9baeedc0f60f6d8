use super::driver::DatabaseDriver;
use crate::config::DatabaseServer;
use crate::credentials::Credential;
use crate::error::Result;
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use tracing::{debug, info};

const SYSTEM_SCHEMAS: [&str; 4] = ["information_schema", "performance_schema", "mysql", "sys"];

pub struct MysqlDriver {
    opts: Opts,
    host: String,
    port: u16,
}

impl MysqlDriver {
    pub fn new(server: &DatabaseServer, credential: &Credential) -> Self {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(server.host.clone())
            .tcp_port(server.port)
            .user(Some(credential.username()))
            .pass(Some(credential.secret()))
            .into();

        Self {
            opts,
            host: server.host.clone(),
            port: server.port,
        }
    }

    async fn get_conn(&self) -> Result<Conn> {
        Ok(Conn::new(self.opts.clone()).await?)
    }
}

pub(crate) fn filter_user_databases(databases: Vec<String>) -> Vec<String> {
    databases
        .into_iter()
        .filter(|db| !SYSTEM_SCHEMAS.contains(&db.as_str()))
        .collect()
}

#[async_trait]
impl DatabaseDriver for MysqlDriver {
    async fn test_connection(&self) -> Result<()> {
        info!("Testing MySQL connection to {}:{}", self.host, self.port);
        let mut conn = self.get_conn().await?;
        let _: Option<(i32,)> = conn.query_first("SELECT 1").await?;
        conn.disconnect().await?;
        info!("MySQL connection successful");
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        debug!("Listing MySQL databases on {}:{}", self.host, self.port);
        let mut conn = self.get_conn().await?;
        let databases: Vec<String> = conn.query("SHOW DATABASES").await?;
        conn.disconnect().await?;
        let filtered = filter_user_databases(databases);

        debug!("Found {} user databases", filtered.len());
        Ok(filtered)
    }

    fn engine_name(&self) -> &'static str {
        "MySQL"
    }
}
