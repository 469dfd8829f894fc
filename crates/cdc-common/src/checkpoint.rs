use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ResumeToken;

/// Persistent `(job_id, collection)` → resume-token mapping (C1's owned row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub collection: String,
    pub resume_token: ResumeToken,
    pub last_event_time: Option<DateTime<Utc>>,
    pub records_processed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
