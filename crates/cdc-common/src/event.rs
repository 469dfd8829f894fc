use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque cursor position in the source's oplog.
///
/// Treated as an immutable byte blob: the core never introspects it beyond
/// the "non-empty document" check used for corruption detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken(pub bson::Document);

impl ResumeToken {
    pub fn new(doc: bson::Document) -> Self {
        Self(doc)
    }

    /// Matches the source's validation: a token is valid if it has a `_data`
    /// field or is otherwise a non-empty document.
    pub fn is_valid(&self) -> bool {
        self.0.contains_key("_data") || !self.0.is_empty()
    }

    pub fn into_document(self) -> bson::Document {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Invalidate,
    Drop,
    Rename,
    Other,
}

impl OperationType {
    /// The operations that carry a meaningful post-image for schema evaluation.
    pub fn carries_full_document(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Replace)
    }
}

/// One oplog entry as surfaced by the change-stream cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation_type: OperationType,
    pub document_key: bson::Document,
    pub full_document: Option<bson::Document>,
    pub cluster_time: DateTime<Utc>,
    pub resume_token: ResumeToken,
}

impl ChangeEvent {
    pub fn lag_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.cluster_time).num_milliseconds().max(0) as f64 / 1000.0
    }
}
