use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::JobLogEntry;
use crate::error::{AppError, AppResult};

// ============================================================================
// Job Log Repository
// ============================================================================

pub struct JobLogRepository;

impl JobLogRepository {
    pub async fn append(
        pool: &SqlitePool,
        job_id: &str,
        level: &str,
        message: &str,
    ) -> AppResult<JobLogEntry> {
        let now = Utc::now().naive_utc();

        sqlx::query_as::<_, JobLogEntry>(
            r#"
            INSERT INTO job_logs (job_id, level, message, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, job_id, level, message, created_at
            "#,
        )
        .bind(job_id)
        .bind(level)
        .bind(message)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    /// All log lines of a job, oldest first.
    pub async fn list_for_job(pool: &SqlitePool, job_id: &str) -> AppResult<Vec<JobLogEntry>> {
        sqlx::query_as::<_, JobLogEntry>(
            r#"
            SELECT id, job_id, level, message, created_at
            FROM job_logs
            WHERE job_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn delete_for_job(pool: &SqlitePool, job_id: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM job_logs WHERE job_id = ?")
            .bind(job_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}
