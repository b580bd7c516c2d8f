use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Marker stating that a message with this content key was already sent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub sent_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

/// Size of the idempotency cache as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_keys: i64,
    pub memory_usage_human: String,
}

impl CacheStats {
    pub fn unavailable() -> Self {
        Self {
            total_keys: 0,
            memory_usage_human: "N/A".to_string(),
        }
    }
}
