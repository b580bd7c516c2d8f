use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One line of a job's durable audit trail.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub job_id: String,
    /// 'info', 'warn', 'error', 'success'
    pub level: String,
    pub message: String,
    pub created_at: NaiveDateTime,
}
