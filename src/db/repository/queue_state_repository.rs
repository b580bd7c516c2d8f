use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{AppError, AppResult};

/// Persisted, queue-wide flags shared by every worker process.
pub struct QueueStateRepository;

impl QueueStateRepository {
    pub async fn set_paused(pool: &SqlitePool, queue: &str, paused: bool) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            r#"
            INSERT INTO queue_state (queue, paused, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(queue) DO UPDATE SET
                paused = excluded.paused,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(queue)
        .bind(paused)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn is_paused(pool: &SqlitePool, queue: &str) -> AppResult<bool> {
        let paused: Option<bool> =
            sqlx::query_scalar("SELECT paused FROM queue_state WHERE queue = ?")
                .bind(queue)
                .fetch_optional(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(paused.unwrap_or(false))
    }
}
