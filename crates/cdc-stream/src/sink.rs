use async_trait::async_trait;
use cdc_common::ChangeEvent;

/// The external write path (§6). Must be idempotent with respect to
/// `document_key` and must not return until its durable work is complete —
/// raising means "do not advance the checkpoint" (§4.4.2).
#[async_trait]
pub trait SinkCallback: Send + Sync {
    async fn call(&self, batch: &[ChangeEvent]) -> anyhow::Result<()>;
}

/// Optional forwarding target for generated `ADD COLUMN` DDL (§4.3). Some
/// sinks infer schema lazily on next write, in which case an implementation
/// can no-op here and let the registered `SchemaVersion` alone drive it.
#[async_trait]
pub trait SchemaSinkAdapter: Send + Sync {
    async fn apply_ddl(&self, table: &str, statements: &[String]) -> anyhow::Result<()>;
}
