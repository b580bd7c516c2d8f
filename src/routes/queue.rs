use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;

use crate::error::AppResult;
use crate::routes::ApiResponse;
use crate::services::classifier::FailurePolicy;
use crate::services::email_processor::{CleanupReport, ProcessorStats};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/pause", post(pause_queue))
        .route("/resume", post(resume_queue))
        .route("/cleanup", post(force_cleanup))
        .route("/jobs/:id", delete(cancel_job))
        .route("/policy", get(get_policy).put(update_policy))
        .route("/cache", delete(clear_cache))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheCleared {
    pub removed_keys: u64,
}

async fn get_stats(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<ProcessorStats>>> {
    let stats = state.processor.stats().await?;
    Ok(Json(ApiResponse::ok("Queue statistics", stats)))
}

async fn pause_queue(State(state): State<Arc<AppState>>) -> AppResult<Json<ApiResponse<()>>> {
    state.processor.queue().pause().await?;
    Ok(Json(ApiResponse::message("Queue paused")))
}

async fn resume_queue(State(state): State<Arc<AppState>>) -> AppResult<Json<ApiResponse<()>>> {
    state.processor.queue().resume().await?;
    Ok(Json(ApiResponse::message("Queue resumed")))
}

/// Run the retention sweep now
async fn force_cleanup(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<CleanupReport>>> {
    let report = state.processor.cleanup_old_jobs().await?;
    Ok(Json(ApiResponse::ok("Cleanup completed", report)))
}

/// Cancel a job that is not running
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<()>>> {
    state.processor.queue().remove_job(&id).await?;
    Ok(Json(ApiResponse::message(format!("Job {} cancelled", id))))
}

async fn get_policy(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<FailurePolicy>>> {
    let policy = state.processor.failure_policy().await;
    Ok(Json(ApiResponse::ok("Current failure policy", policy)))
}

async fn update_policy(
    State(state): State<Arc<AppState>>,
    Json(policy): Json<FailurePolicy>,
) -> AppResult<Json<ApiResponse<FailurePolicy>>> {
    state.processor.set_failure_policy(policy).await?;
    Ok(Json(ApiResponse::ok("Failure policy updated", policy)))
}

async fn clear_cache(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<CacheCleared>>> {
    let removed_keys = state.processor.idempotency().clear_all().await?;
    Ok(Json(ApiResponse::ok(
        "Idempotency cache cleared",
        CacheCleared { removed_keys },
    )))
}
