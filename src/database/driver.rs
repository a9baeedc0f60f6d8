use crate::error::Result;
use async_trait::async_trait;

/// Network-level access to a database server: used for probing and for
/// listing the databases a job may select. Dumps go through the external
/// client tools instead.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    async fn test_connection(&self) -> Result<()>;
    async fn list_databases(&self) -> Result<Vec<String>>;
    fn engine_name(&self) -> &'static str;
}
