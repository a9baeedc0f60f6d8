mod driver;
mod mysql;
mod postgres;

pub use driver::DatabaseDriver;
pub use mysql::MysqlDriver;
pub use postgres::PostgresDriver;

use crate::config::{DatabaseEngine, DatabaseServer};
use crate::credentials::Credential;
use crate::error::{BackupError, Result};
use std::time::Duration;

pub fn create_driver(
    server: &DatabaseServer,
    credential: &Credential,
    connect_timeout: Duration,
) -> Result<Box<dyn DatabaseDriver>> {
    match &server.engine {
        DatabaseEngine::MySQL => Ok(Box::new(MysqlDriver::new(server, credential))),
        DatabaseEngine::PostgreSQL => Ok(Box::new(PostgresDriver::new(server, credential, connect_timeout))),
        DatabaseEngine::Unsupported(name) => Err(BackupError::UnsupportedEngine(name.clone())),
    }
}
