pub mod error;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "mysql")]
pub mod mysql;

use async_trait::async_trait;
use cdc_common::{Schema, SchemaChange, SchemaVersion};

pub use error::{Result, SchemaRegistryError};

/// Append-only versioned schema history per logical table (C2).
///
/// Versions are dense and monotonic per table; a registered version is never
/// mutated or deleted.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn register_version(
        &self,
        table_name: &str,
        schema: &Schema,
        changes: &[SchemaChange],
        applied_by: &str,
        rollback_ddl: Option<&str>,
    ) -> Result<i64>;

    async fn get_latest_schema(&self, table_name: &str) -> Result<Option<Schema>>;

    async fn get_schema(&self, table_name: &str, version: i64) -> Result<Option<Schema>>;

    async fn get_version_history(&self, table_name: &str) -> Result<Vec<SchemaVersion>>;

    async fn get_latest_version_number(&self, table_name: &str) -> Result<i64>;
}
