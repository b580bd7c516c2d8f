use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::models::BatchJobData;
use crate::error::{AppError, AppResult};

/// Lifecycle state of a batch job.
///
/// `waiting -> active -> completed | failed`. A failed attempt that still has
/// attempts left parks the job in `delayed` until its backoff elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    /// Convert from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "delayed" => Some(JobState::Delayed),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A broker-tracked unit of work: one batch of messages.
///
/// The row is the single source of truth for the job's state and progress;
/// callers re-read it instead of holding copies across awaits.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BatchJob {
    /// Job id (equal to the batch id unless the caller chose otherwise)
    pub id: String,

    /// Queue the job belongs to
    pub queue: String,

    /// Job type name, used to pick the registered handler
    pub name: String,

    pub batch_id: String,

    /// Serialized `BatchJobData`
    pub data_json: String,

    /// Higher values are dequeued first
    pub priority: i64,

    /// 'waiting', 'active', 'delayed', 'completed', 'failed'
    pub state: String,

    /// 0..=100, non-decreasing within one attempt
    pub progress: i64,

    pub attempts_made: i64,
    pub max_attempts: i64,

    /// Fixed delay before a failed attempt is retried
    pub backoff_ms: i64,

    /// Times the job lost its lease while active
    pub stalled_count: i64,

    /// Earliest time a worker may claim the job
    pub available_at: NaiveDateTime,

    /// Lease held by the worker processing the job; an expired lease on an
    /// active job means the worker went away.
    pub lock_expires_at: Option<NaiveDateTime>,

    /// Serialized `BatchReport` once completed
    pub result_json: Option<String>,

    /// Serialized failure payload of the last failed attempt
    pub failed_reason: Option<String>,

    pub created_at: NaiveDateTime,
    pub processed_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
}

impl BatchJob {
    pub fn job_state(&self) -> Option<JobState> {
        JobState::from_str(&self.state)
    }

    pub fn data(&self) -> AppResult<BatchJobData> {
        serde_json::from_str(&self.data_json).map_err(AppError::Serialization)
    }

    /// Parsed return value; `None` until the job completes.
    pub fn result(&self) -> Option<serde_json::Value> {
        self.result_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Parsed failure payload. Reasons that are not JSON are returned as strings.
    pub fn failure(&self) -> Option<serde_json::Value> {
        self.failed_reason.as_deref().map(|raw| {
            serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.into()))
        })
    }
}

/// Data required to persist a new batch job.
#[derive(Debug, Clone)]
pub struct CreateBatchJob {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub batch_id: String,
    pub data_json: String,
    pub priority: i64,
    pub max_attempts: i64,
    pub backoff_ms: i64,
}

/// Number of jobs in each state of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}
