//! Runtime schema evolution engine (C3).
//!
//! Detects schema drift between an incoming document/batch and a table's
//! currently registered [`Schema`], classifies each change as SAFE, WARNING,
//! or BREAKING, and can record safe evolutions in a [`SchemaRegistry`].

use std::collections::HashSet;
use std::sync::Arc;

use bson::{Bson, Document};
use cdc_common::schema::{ChangeType, FieldType, Schema, SchemaChange, SchemaChangeResult, SchemaField};
use cdc_schema_registry::SchemaRegistry;

#[derive(Debug, thiserror::Error)]
pub enum SchemaEvalError {
    #[error("schema registry error: {0}")]
    Registry(#[from] cdc_schema_registry::SchemaRegistryError),
}

pub type Result<T> = std::result::Result<T, SchemaEvalError>;

/// Walk a document's fields, flattening nested objects and arrays-of-objects
/// into dot paths. An array of scalars is treated as a leaf.
pub fn extract_fields(document: &Document) -> HashSet<String> {
    let mut fields = HashSet::new();
    extract_fields_inner(document, "", &mut fields);
    fields
}

fn extract_fields_inner(document: &Document, prefix: &str, out: &mut HashSet<String>) {
    for (key, value) in document {
        let field_name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        match value {
            Bson::Document(nested) => extract_fields_inner(nested, &field_name, out),
            Bson::Array(items) => {
                if let Some(Bson::Document(first)) = items.first() {
                    extract_fields_inner(first, &field_name, out);
                } else {
                    out.insert(field_name);
                }
            }
            _ => {
                out.insert(field_name);
            }
        }
    }
}

fn navigate<'a>(document: &'a Document, field_path: &str) -> Option<&'a Bson> {
    let mut parts = field_path.split('.');
    let mut current = document.get(parts.next()?)?;

    for part in parts {
        current = match current {
            Bson::Document(doc) => doc.get(part)?,
            Bson::Array(items) => match items.first() {
                Some(Bson::Document(doc)) => doc.get(part)?,
                Some(other) => other,
                None => return None,
            },
            _ => return None,
        };
    }
    Some(current)
}

/// Infer a field's type from a document, defaulting to `String` for missing
/// or unrecognized values, mirroring the original evaluator's conservative
/// fallback.
pub fn infer_field_type(document: &Document, field_path: &str) -> FieldType {
    match navigate(document, field_path) {
        Some(Bson::String(_)) => FieldType::String,
        Some(Bson::Int32(_)) | Some(Bson::Int64(_)) => FieldType::Integer,
        Some(Bson::Double(_)) => FieldType::Float,
        Some(Bson::Boolean(_)) => FieldType::Boolean,
        Some(Bson::DateTime(_)) => FieldType::Datetime,
        Some(Bson::Document(_)) => FieldType::Object,
        Some(Bson::Array(_)) => FieldType::Array,
        _ => FieldType::String,
    }
}

/// A field is nullable if it is absent or explicitly null.
pub fn is_field_nullable(document: &Document, field_path: &str) -> bool {
    match navigate(document, field_path) {
        Some(Bson::Null) | None => true,
        Some(_) => false,
    }
}

/// Classify a type transition per the fixed compatibility matrix (§4.3).
pub fn classify_type_change(old_type: FieldType, new_type: FieldType) -> ChangeType {
    use FieldType::*;

    if old_type == new_type {
        return ChangeType::Safe;
    }

    match (old_type, new_type) {
        (Integer, Float) => ChangeType::Warning,
        (Boolean, String) => ChangeType::Warning,
        (Object, String) | (Array, String) => ChangeType::Warning,
        _ => ChangeType::Breaking,
    }
}

/// Evaluate a single document against the table's currently registered
/// schema, producing every detected field addition/removal/type/nullability
/// change.
pub fn evaluate_document(document: &Document, current_schema: &Schema) -> SchemaChangeResult {
    let mut result = SchemaChangeResult::default();

    let doc_fields = extract_fields(document);
    let schema_fields: HashSet<String> = current_schema.keys().cloned().collect();

    for field_name in doc_fields.difference(&schema_fields) {
        let new_type = infer_field_type(document, field_name);
        result.push(SchemaChange {
            field_name: field_name.clone(),
            change_type: ChangeType::Safe,
            old_type: None,
            new_type: Some(new_type),
            old_nullable: None,
            new_nullable: Some(true),
            description: format!("New field '{field_name}' detected"),
        });
    }

    for field_name in schema_fields.difference(&doc_fields) {
        let old_field = &current_schema[field_name];
        let change_type = if !old_field.nullable {
            ChangeType::Breaking
        } else {
            ChangeType::Warning
        };
        result.push(SchemaChange {
            field_name: field_name.clone(),
            change_type,
            old_type: Some(old_field.field_type),
            new_type: None,
            old_nullable: Some(old_field.nullable),
            new_nullable: None,
            description: format!("Field '{field_name}' removed from documents"),
        });
    }

    for field_name in doc_fields.intersection(&schema_fields) {
        let old_field = &current_schema[field_name];
        let new_type = infer_field_type(document, field_name);
        let new_nullable = is_field_nullable(document, field_name);

        if old_field.field_type != new_type {
            result.push(SchemaChange {
                field_name: field_name.clone(),
                change_type: classify_type_change(old_field.field_type, new_type),
                old_type: Some(old_field.field_type),
                new_type: Some(new_type),
                old_nullable: Some(old_field.nullable),
                new_nullable: Some(new_nullable),
                description: format!(
                    "Type changed from {:?} to {:?}",
                    old_field.field_type, new_type
                ),
            });
        }

        if !old_field.nullable && new_nullable {
            result.push(SchemaChange {
                field_name: field_name.clone(),
                change_type: ChangeType::Breaking,
                old_type: Some(old_field.field_type),
                new_type: Some(new_type),
                old_nullable: Some(old_field.nullable),
                new_nullable: Some(new_nullable),
                description: format!("Field '{field_name}' became nullable (was required)"),
            });
        } else if old_field.nullable && !new_nullable {
            result.push(SchemaChange {
                field_name: field_name.clone(),
                change_type: ChangeType::Safe,
                old_type: Some(old_field.field_type),
                new_type: Some(new_type),
                old_nullable: Some(old_field.nullable),
                new_nullable: Some(new_nullable),
                description: format!("Field '{field_name}' became required (was nullable)"),
            });
        }
    }

    result
}

/// Evaluate a micro-batch, deduplicating identical changes across documents
/// by `(field_name, change_type, old_type, new_type)`.
pub fn evaluate_batch(batch: &[Document], current_schema: &Schema) -> SchemaChangeResult {
    let mut result = SchemaChangeResult::default();
    let mut seen: HashSet<(String, ChangeType, Option<FieldType>, Option<FieldType>)> = HashSet::new();

    for document in batch {
        let doc_result = evaluate_document(document, current_schema);
        for change in doc_result.all_changes() {
            let key = (
                change.field_name.clone(),
                change.change_type,
                change.old_type,
                change.new_type,
            );
            if seen.insert(key) {
                result.push(change.clone());
            }
        }
    }

    result
}

/// Apply a set of changes to the current schema, producing the evolved
/// schema. Breaking changes are never auto-applied; safe changes add fields,
/// warning changes widen an existing field's type in place.
pub fn build_evolved_schema(current_schema: &Schema, changes: &[SchemaChange]) -> Schema {
    let mut evolved = current_schema.clone();

    for change in changes {
        match change.change_type {
            ChangeType::Safe => {
                evolved.insert(
                    change.field_name.clone(),
                    SchemaField {
                        field_type: change.new_type.unwrap_or(FieldType::String),
                        nullable: change.new_nullable.unwrap_or(true),
                        description: Some(change.description.clone()),
                    },
                );
            }
            ChangeType::Breaking => {
                tracing::warn!(field = %change.field_name, "skipping breaking change during auto-evolution");
            }
            ChangeType::Warning => {
                if let Some(field) = evolved.get_mut(&change.field_name) {
                    if let Some(new_type) = change.new_type {
                        field.field_type = new_type;
                    }
                    tracing::info!(
                        field = %change.field_name,
                        old_type = ?change.old_type,
                        new_type = ?change.new_type,
                        "widened field type"
                    );
                }
            }
        }
    }

    evolved
}

/// Map a field type to the lakehouse sink's DDL type lexicon (§4.3).
pub fn map_to_spark_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "STRING",
        FieldType::Integer => "BIGINT",
        FieldType::Float => "DOUBLE",
        FieldType::Boolean => "BOOLEAN",
        FieldType::Datetime => "TIMESTAMP",
        FieldType::Object => "STRING",
        FieldType::Array => "STRING",
    }
}

/// Generate `ALTER TABLE ADD COLUMN` DDL for the safe changes in a set,
/// ignoring anything that isn't SAFE.
pub fn generate_ddl(table_name: &str, changes: &[SchemaChange]) -> Vec<String> {
    changes
        .iter()
        .filter(|c| c.change_type == ChangeType::Safe && c.new_type.is_some())
        .map(|c| {
            let spark_type = map_to_spark_type(c.new_type.unwrap());
            let mut ddl = format!("ALTER TABLE {table_name} ADD COLUMN {} {spark_type}", c.field_name);
            if c.new_nullable == Some(false) {
                ddl.push_str(" NOT NULL");
            }
            ddl
        })
        .collect()
}

/// Drives schema evolution against a [`SchemaRegistry`]: filters to safe
/// changes, builds the evolved schema, generates sink DDL, and records the
/// new version.
pub struct SchemaEvaluator {
    registry: Arc<dyn SchemaRegistry>,
}

impl SchemaEvaluator {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Evolve a sink table's schema for the safe changes in `changes`,
    /// registering a new [`cdc_common::schema::SchemaVersion`] and returning
    /// the generated DDL. No-ops (returning an empty DDL list) if there are
    /// no safe changes to apply.
    pub async fn evolve_sink_schema(
        &self,
        table_name: &str,
        current_schema: &Schema,
        changes: &[SchemaChange],
        applied_by: &str,
    ) -> Result<Vec<String>> {
        let safe_changes: Vec<SchemaChange> = changes
            .iter()
            .filter(|c| c.change_type == ChangeType::Safe)
            .cloned()
            .collect();

        if safe_changes.is_empty() {
            tracing::info!(table_name, "no safe changes to apply");
            return Ok(Vec::new());
        }

        let ddl_statements = generate_ddl(table_name, &safe_changes);
        let evolved_schema = build_evolved_schema(current_schema, &safe_changes);

        self.registry
            .register_version(table_name, &evolved_schema, &safe_changes, applied_by, None)
            .await?;

        tracing::info!(table_name, changes = safe_changes.len(), "evolved sink schema");
        Ok(ddl_statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn schema_with(field: &str, field_type: FieldType, nullable: bool) -> Schema {
        let mut schema = Schema::new();
        schema.insert(field.to_string(), SchemaField::new(field_type, nullable));
        schema
    }

    #[test]
    fn new_field_is_safe_and_nullable() {
        let doc = doc! { "name": "alice", "age": 30 };
        let schema = schema_with("name", FieldType::String, false);

        let result = evaluate_document(&doc, &schema);
        assert!(result.has_safe());
        assert!(!result.has_breaking());
        let change = result.safe_changes.iter().find(|c| c.field_name == "age").unwrap();
        assert_eq!(change.new_type, Some(FieldType::Integer));
        assert_eq!(change.new_nullable, Some(true));
    }

    #[test]
    fn removing_a_required_field_is_breaking() {
        let doc = doc! { "name": "alice" };
        let schema = schema_with("age", FieldType::Integer, false);

        let result = evaluate_document(&doc, &schema);
        assert!(result.has_breaking());
    }

    #[test]
    fn removing_a_nullable_field_is_warning() {
        let doc = doc! {};
        let schema = schema_with("age", FieldType::Integer, true);

        let result = evaluate_document(&doc, &schema);
        assert!(result.has_warning());
        assert!(!result.has_breaking());
    }

    #[test]
    fn integer_to_float_widening_is_warning() {
        assert_eq!(
            classify_type_change(FieldType::Integer, FieldType::Float),
            ChangeType::Warning
        );
    }

    #[test]
    fn integer_to_string_narrowing_is_breaking() {
        assert_eq!(
            classify_type_change(FieldType::Integer, FieldType::String),
            ChangeType::Breaking
        );
    }

    #[test]
    fn object_to_string_is_warning_but_string_to_object_is_breaking() {
        assert_eq!(classify_type_change(FieldType::Object, FieldType::String), ChangeType::Warning);
        assert_eq!(classify_type_change(FieldType::String, FieldType::Object), ChangeType::Breaking);
    }

    #[test]
    fn required_to_nullable_is_breaking_nullable_to_required_is_safe() {
        let doc = doc! { "age": Bson::Null };
        let schema = schema_with("age", FieldType::Integer, false);
        let result = evaluate_document(&doc, &schema);
        assert!(result.has_breaking());

        let doc = doc! { "age": 5 };
        let schema = schema_with("age", FieldType::Integer, true);
        let result = evaluate_document(&doc, &schema);
        assert!(result.has_safe());
    }

    #[test]
    fn extract_fields_flattens_nested_objects_and_array_of_objects() {
        let doc = doc! {
            "name": "widget",
            "specs": { "cpu": "arm", "cores": 4 },
            "tags": [ { "label": "new" }, { "label": "sale" } ],
        };
        let fields = extract_fields(&doc);
        assert!(fields.contains("name"));
        assert!(fields.contains("specs.cpu"));
        assert!(fields.contains("specs.cores"));
        assert!(fields.contains("tags.label"));
    }

    #[test]
    fn evaluate_batch_deduplicates_identical_changes() {
        let schema = schema_with("name", FieldType::String, false);
        let batch = vec![doc! { "name": "a", "age": 1 }, doc! { "name": "b", "age": 2 }];

        let result = evaluate_batch(&batch, &schema);
        let age_changes: Vec<_> = result.safe_changes.iter().filter(|c| c.field_name == "age").collect();
        assert_eq!(age_changes.len(), 1);
    }

    #[test]
    fn generate_ddl_only_emits_safe_changes() {
        let changes = vec![
            SchemaChange {
                field_name: "age".to_string(),
                change_type: ChangeType::Safe,
                old_type: None,
                new_type: Some(FieldType::Integer),
                old_nullable: None,
                new_nullable: Some(true),
                description: "new field".to_string(),
            },
            SchemaChange {
                field_name: "legacy".to_string(),
                change_type: ChangeType::Breaking,
                old_type: Some(FieldType::String),
                new_type: None,
                old_nullable: Some(false),
                new_nullable: None,
                description: "removed".to_string(),
            },
        ];

        let ddl = generate_ddl("products", &changes);
        assert_eq!(ddl, vec!["ALTER TABLE products ADD COLUMN age BIGINT".to_string()]);
    }

    #[test]
    fn build_evolved_schema_adds_safe_and_skips_breaking() {
        let current = schema_with("name", FieldType::String, false);
        let changes = vec![
            SchemaChange {
                field_name: "age".to_string(),
                change_type: ChangeType::Safe,
                old_type: None,
                new_type: Some(FieldType::Integer),
                old_nullable: None,
                new_nullable: Some(true),
                description: "new field".to_string(),
            },
            SchemaChange {
                field_name: "name".to_string(),
                change_type: ChangeType::Breaking,
                old_type: Some(FieldType::String),
                new_type: Some(FieldType::Object),
                old_nullable: Some(false),
                new_nullable: Some(false),
                description: "narrowing".to_string(),
            },
        ];

        let evolved = build_evolved_schema(&current, &changes);
        assert!(evolved.contains_key("age"));
        assert_eq!(evolved["name"].field_type, FieldType::String);
    }
}
