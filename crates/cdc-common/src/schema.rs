use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The core's closed set of inferred/declared field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Datetime,
    Object,
    Array,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub nullable: bool,
    pub description: Option<String>,
}

impl SchemaField {
    pub fn new(field_type: FieldType, nullable: bool) -> Self {
        Self {
            field_type,
            nullable,
            description: None,
        }
    }
}

/// Dot-path field name → declared field. One logical table's schema.
pub type Schema = BTreeMap<String, SchemaField>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Safe,
    Warning,
    Breaking,
}

impl ChangeType {
    /// Worst-of aggregation across a set of changes, per §3.
    pub fn worst_of(changes: impl IntoIterator<Item = ChangeType>) -> ChangeType {
        changes
            .into_iter()
            .max()
            .unwrap_or(ChangeType::Safe)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChange {
    pub field_name: String,
    pub change_type: ChangeType,
    pub old_type: Option<FieldType>,
    pub new_type: Option<FieldType>,
    pub old_nullable: Option<bool>,
    pub new_nullable: Option<bool>,
    pub description: String,
}

/// Changes bucketed by severity, produced by `evaluate_document`/`evaluate_batch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaChangeResult {
    pub safe_changes: Vec<SchemaChange>,
    pub warning_changes: Vec<SchemaChange>,
    pub breaking_changes: Vec<SchemaChange>,
}

impl SchemaChangeResult {
    pub fn has_breaking(&self) -> bool {
        !self.breaking_changes.is_empty()
    }

    pub fn has_warning(&self) -> bool {
        !self.warning_changes.is_empty()
    }

    pub fn has_safe(&self) -> bool {
        !self.safe_changes.is_empty()
    }

    pub fn all_changes(&self) -> impl Iterator<Item = &SchemaChange> {
        self.safe_changes
            .iter()
            .chain(self.warning_changes.iter())
            .chain(self.breaking_changes.iter())
    }

    pub fn push(&mut self, change: SchemaChange) {
        match change.change_type {
            ChangeType::Safe => self.safe_changes.push(change),
            ChangeType::Warning => self.warning_changes.push(change),
            ChangeType::Breaking => self.breaking_changes.push(change),
        }
    }
}

/// One append-only entry in a logical table's schema history (C2's owned row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub table_name: String,
    pub version: i64,
    pub schema: Schema,
    pub changes: Vec<SchemaChange>,
    pub change_type: ChangeType,
    pub applied_at: DateTime<Utc>,
    pub applied_by: String,
    pub rollback_ddl: Option<String>,
}
