use async_trait::async_trait;
use cdc_common::{ChangeType, Schema, SchemaChange, SchemaVersion};
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row};

use crate::error::{Result, SchemaRegistryError};
use crate::SchemaRegistry;

pub struct MySqlSchemaRegistry {
    pool: MySqlPool,
}

impl MySqlSchemaRegistry {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                table_name VARCHAR(255) NOT NULL,
                version BIGINT NOT NULL,
                schema_json JSON NOT NULL,
                changes_json JSON NOT NULL,
                change_type VARCHAR(16) NOT NULL,
                applied_at DATETIME NOT NULL,
                applied_by VARCHAR(255) NOT NULL,
                rollback_ddl TEXT,
                UNIQUE KEY uniq_table_version (table_name, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;
        Ok(())
    }
}

fn change_type_str(ct: ChangeType) -> &'static str {
    match ct {
        ChangeType::Safe => "SAFE",
        ChangeType::Warning => "WARNING",
        ChangeType::Breaking => "BREAKING",
    }
}

fn parse_change_type(s: &str) -> ChangeType {
    match s {
        "BREAKING" => ChangeType::Breaking,
        "WARNING" => ChangeType::Warning,
        _ => ChangeType::Safe,
    }
}

#[async_trait]
impl SchemaRegistry for MySqlSchemaRegistry {
    async fn register_version(
        &self,
        table_name: &str,
        schema: &Schema,
        changes: &[SchemaChange],
        applied_by: &str,
        rollback_ddl: Option<&str>,
    ) -> Result<i64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;

        let max_version: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM schema_versions WHERE table_name = ? FOR UPDATE",
        )
        .bind(table_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;

        let new_version = max_version.unwrap_or(0) + 1;
        let change_type = ChangeType::worst_of(changes.iter().map(|c| c.change_type));
        let schema_json = serde_json::to_string(schema)
            .map_err(|e| SchemaRegistryError::Serialization(e.to_string()))?;
        let changes_json = serde_json::to_string(changes)
            .map_err(|e| SchemaRegistryError::Serialization(e.to_string()))?;
        let applied_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO schema_versions
                (table_name, version, schema_json, changes_json, change_type, applied_at, applied_by, rollback_ddl)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(table_name)
        .bind(new_version)
        .bind(&schema_json)
        .bind(&changes_json)
        .bind(change_type_str(change_type))
        .bind(applied_at)
        .bind(applied_by)
        .bind(rollback_ddl)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if e.to_string().contains("Duplicate entry") {
                SchemaRegistryError::DuplicateVersion {
                    table_name: table_name.to_string(),
                    version: new_version,
                }
            } else {
                SchemaRegistryError::Database(e.to_string())
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;

        tracing::info!(table_name, version = new_version, "registered schema version");
        Ok(new_version)
    }

    async fn get_latest_schema(&self, table_name: &str) -> Result<Option<Schema>> {
        let row = sqlx::query(
            "SELECT schema_json FROM schema_versions WHERE table_name = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(table_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;

        row.map(|r| {
            let schema_json: String = r.get("schema_json");
            serde_json::from_str(&schema_json).map_err(|e| SchemaRegistryError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn get_schema(&self, table_name: &str, version: i64) -> Result<Option<Schema>> {
        let row = sqlx::query(
            "SELECT schema_json FROM schema_versions WHERE table_name = ? AND version = ?",
        )
        .bind(table_name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;

        row.map(|r| {
            let schema_json: String = r.get("schema_json");
            serde_json::from_str(&schema_json).map_err(|e| SchemaRegistryError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn get_version_history(&self, table_name: &str) -> Result<Vec<SchemaVersion>> {
        let rows = sqlx::query(
            "SELECT table_name, version, schema_json, changes_json, change_type, applied_at, applied_by, rollback_ddl \
             FROM schema_versions WHERE table_name = ? ORDER BY version ASC",
        )
        .bind(table_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let schema_json: String = row.get("schema_json");
            let changes_json: String = row.get("changes_json");
            let change_type: String = row.get("change_type");
            let applied_at: DateTime<Utc> = row.get("applied_at");

            out.push(SchemaVersion {
                table_name: row.get("table_name"),
                version: row.get("version"),
                schema: serde_json::from_str(&schema_json)
                    .map_err(|e| SchemaRegistryError::Serialization(e.to_string()))?,
                changes: serde_json::from_str(&changes_json)
                    .map_err(|e| SchemaRegistryError::Serialization(e.to_string()))?,
                change_type: parse_change_type(&change_type),
                applied_at,
                applied_by: row.get("applied_by"),
                rollback_ddl: row.get("rollback_ddl"),
            });
        }
        Ok(out)
    }

    async fn get_latest_version_number(&self, table_name: &str) -> Result<i64> {
        let max_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_versions WHERE table_name = ?")
                .bind(table_name)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;
        Ok(max_version.unwrap_or(0))
    }
}
