use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::{BatchJob, BatchJobData, EmailMessage, JobLogEntry};
use crate::error::{AppError, AppErrorWithDetails, AppResult};
use crate::routes::ApiResponse;
use crate::services::mail::validate_email;
use crate::services::queue::MAX_BATCH_SIZE;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/batch", post(submit_batch))
        .route("/jobs/active", get(list_active_jobs))
        .route("/jobs/:id", get(get_job_status))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Either a bare list of messages or an object carrying batch options.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SubmitBatchRequest {
    Messages(Vec<EmailMessage>),
    Batch(BatchSubmission),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSubmission {
    pub batch_id: Option<String>,
    pub priority: Option<i64>,
    #[serde(alias = "emails")]
    pub messages: Vec<EmailMessage>,
}

impl SubmitBatchRequest {
    fn into_parts(self) -> (Option<String>, i64, Vec<EmailMessage>) {
        match self {
            SubmitBatchRequest::Messages(messages) => (None, 0, messages),
            SubmitBatchRequest::Batch(batch) => {
                (batch.batch_id, batch.priority.unwrap_or(0), batch.messages)
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidMessage {
    pub index: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAccepted {
    pub job_id: String,
    pub batch_id: String,
    pub total_emails: usize,
    pub priority: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJobResponse {
    pub job_id: String,
    pub batch_id: String,
    pub progress: i64,
    pub attempts: i64,
    pub processed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub progress: i64,
    pub data: Option<BatchJobData>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: NaiveDateTime,
    pub processed_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub logs: Vec<JobLogEntry>,
}

impl JobStatusResponse {
    fn new(job: BatchJob, logs: Vec<JobLogEntry>) -> Self {
        let data = match job.data() {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::warn!("Job {} has an unreadable payload: {}", job.id, e);
                None
            }
        };

        Self {
            result: job.result(),
            error: job.failure(),
            data,
            job_id: job.id,
            status: job.state,
            progress: job.progress,
            created_at: job.created_at,
            processed_at: job.processed_at,
            finished_at: job.finished_at,
            attempts: job.attempts_made,
            max_attempts: job.max_attempts,
            logs,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Validate and enqueue a batch of messages
async fn submit_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitBatchRequest>,
) -> Result<(StatusCode, Json<ApiResponse<BatchAccepted>>), AppErrorWithDetails> {
    let (batch_id, priority, messages) = request.into_parts();

    if messages.is_empty() {
        return Err(AppError::BadRequest(
            "messages array is required and cannot be empty".to_string(),
        )
        .into());
    }
    if messages.len() > MAX_BATCH_SIZE {
        return Err(AppError::Conflict(format!(
            "Maximum {} messages per batch",
            MAX_BATCH_SIZE
        ))
        .into());
    }

    let invalid: Vec<InvalidMessage> = messages
        .iter()
        .enumerate()
        .filter_map(|(index, message)| {
            let errors = validate_email(message);
            if errors.is_empty() {
                None
            } else {
                Some(InvalidMessage { index, errors })
            }
        })
        .collect();
    if !invalid.is_empty() {
        return Err(AppError::BadRequest(format!(
            "{} invalid messages in batch",
            invalid.len()
        ))
        .with_details(serde_json::json!({ "invalid": invalid })));
    }

    let total = messages.len();
    let job = state
        .processor
        .queue()
        .enqueue(batch_id, messages, priority)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok(
            "Batch queued successfully",
            BatchAccepted {
                job_id: job.id,
                batch_id: job.batch_id,
                total_emails: total,
                priority: job.priority,
                status: job.state,
            },
        )),
    ))
}

async fn list_active_jobs(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<Vec<ActiveJobResponse>>>> {
    let jobs = state.processor.queue().get_active().await?;

    let active = jobs
        .into_iter()
        .map(|job| ActiveJobResponse {
            job_id: job.id,
            batch_id: job.batch_id,
            progress: job.progress,
            attempts: job.attempts_made,
            processed_at: job.processed_at,
        })
        .collect::<Vec<_>>();

    Ok(Json(ApiResponse::ok(
        format!("{} active jobs", active.len()),
        active,
    )))
}

async fn get_job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<JobStatusResponse>>> {
    let queue = state.processor.queue();
    let job = queue
        .get_job(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
    let logs = queue.job_logs(&id).await?;

    Ok(Json(ApiResponse::ok(
        "Job status retrieved",
        JobStatusResponse::new(job, logs),
    )))
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use serde_json::json;

    use crate::routes::testing::{call, test_state};

    fn message(to: &str) -> serde_json::Value {
        json!({
            "from": { "name": "Billing", "email": "billing@example.com" },
            "to": { "name": "Customer", "email": to },
            "subject": "Invoice",
            "html": "<p>Invoice</p>"
        })
    }

    #[tokio::test]
    async fn accepts_bare_message_list() {
        let state = test_state().await;
        let (status, body) = call(
            &state,
            "POST",
            "/api/mail/batch",
            Some(json!([message("a@example.com"), message("b@example.com")])),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["totalEmails"], 2);
        assert_eq!(body["data"]["status"], "waiting");
        assert!(body["data"]["batchId"].as_str().unwrap().starts_with("batch-"));
    }

    #[tokio::test]
    async fn accepts_batch_options_and_reports_status() {
        let state = test_state().await;
        let (status, _) = call(
            &state,
            "POST",
            "/api/mail/batch",
            Some(json!({
                "batchId": "march-invoices",
                "priority": 7,
                "messages": [message("a@example.com")]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = call(&state, "GET", "/api/mail/jobs/march-invoices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "waiting");
        assert_eq!(body["data"]["attempts"], 0);
        assert_eq!(body["data"]["maxAttempts"], 3);
        assert_eq!(body["data"]["data"]["batchId"], "march-invoices");
        assert!(body["data"]["result"].is_null());
    }

    #[tokio::test]
    async fn rejects_empty_and_oversized_batches() {
        let state = test_state().await;

        let (status, body) = call(&state, "POST", "/api/mail/batch", Some(json!([]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");

        let oversized: Vec<_> = (0..1001)
            .map(|i| message(&format!("user{}@example.com", i)))
            .collect();
        let (status, _) = call(&state, "POST", "/api/mail/batch", Some(json!(oversized))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn reports_invalid_message_indexes() {
        let state = test_state().await;
        let (status, body) = call(
            &state,
            "POST",
            "/api/mail/batch",
            Some(json!([
                message("a@example.com"),
                message("not-an-address"),
                message("c@example.com")
            ])),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let invalid = body["error"]["details"]["invalid"].as_array().unwrap();
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0]["index"], 1);
        assert_eq!(invalid[0]["errors"][0], "recipient email is invalid");

        let (_, stats) = call(&state, "GET", "/api/queue/stats", None).await;
        assert_eq!(stats["data"]["queue"]["waiting"], 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let state = test_state().await;
        let (status, body) = call(&state, "GET", "/api/mail/jobs/nope", None).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn lists_active_jobs() {
        let state = test_state().await;
        call(
            &state,
            "POST",
            "/api/mail/batch",
            Some(json!({ "batchId": "running", "messages": [message("a@example.com")] })),
        )
        .await;
        state.processor.queue().claim_next().await.unwrap();

        let (status, body) = call(&state, "GET", "/api/mail/jobs/active", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["jobId"], "running");
    }
}
