#[derive(Debug, thiserror::Error)]
pub enum SchemaRegistryError {
    #[error("schema registry database error: {0}")]
    Database(String),

    #[error("schema serialization error: {0}")]
    Serialization(String),

    #[error("duplicate schema version for table {table_name} version {version}")]
    DuplicateVersion { table_name: String, version: i64 },
}

pub type Result<T> = std::result::Result<T, SchemaRegistryError>;
