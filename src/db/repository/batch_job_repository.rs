use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::{BatchJob, CreateBatchJob, JobState, QueueCounts};
use crate::error::{AppError, AppResult};

const JOB_COLUMNS: &str = r#"
    id,
    queue,
    name,
    batch_id,
    data_json,
    priority,
    state,
    progress,
    attempts_made,
    max_attempts,
    backoff_ms,
    stalled_count,
    available_at,
    lock_expires_at,
    result_json,
    failed_reason,
    created_at,
    processed_at,
    finished_at,
    updated_at
"#;

/// Failed reason stored on a job that stalled too often.
pub const STALLED_LIMIT_REASON: &str = "job stalled more than allowable limit";

/// Repository for the persistent batch job queue.
///
/// Implementation notes:
/// - State transitions are single statements guarded by the expected current
///   state, so two workers can never both move the same job.
/// - Claiming uses `UPDATE ... WHERE id = (SELECT id ... LIMIT 1) RETURNING ...`
///   and refuses work while the queue is paused, without a long transaction.
pub struct BatchJobRepository;

impl BatchJobRepository {
    /// Insert a new job in `waiting` state, immediately claimable.
    ///
    /// A job id that already exists is reported as `AppError::Conflict`.
    pub async fn create(pool: &SqlitePool, job: CreateBatchJob) -> AppResult<BatchJob> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            INSERT INTO batch_jobs (
                id,
                queue,
                name,
                batch_id,
                data_json,
                priority,
                state,
                progress,
                attempts_made,
                max_attempts,
                backoff_ms,
                available_at,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'waiting', 0, 0, ?, ?, ?, ?, ?)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let id = job.id.clone();
        sqlx::query_as::<_, BatchJob>(&sql)
            .bind(job.id)
            .bind(job.queue)
            .bind(job.name)
            .bind(job.batch_id)
            .bind(job.data_json)
            .bind(job.priority)
            .bind(job.max_attempts)
            .bind(job.backoff_ms)
            .bind(now)
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    AppError::Conflict(format!("Job {} already exists", id))
                }
                other => AppError::Database(other),
            })
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<BatchJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM batch_jobs WHERE id = ?");
        sqlx::query_as::<_, BatchJob>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Jobs of a queue in the given state, in the order a worker would see them.
    pub async fn list_by_state(
        pool: &SqlitePool,
        queue: &str,
        state: JobState,
    ) -> AppResult<Vec<BatchJob>> {
        let order = if state.is_terminal() {
            "finished_at DESC"
        } else {
            "priority DESC, available_at ASC, created_at ASC, rowid ASC"
        };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE queue = ? AND state = ? ORDER BY {order}"
        );

        sqlx::query_as::<_, BatchJob>(&sql)
            .bind(queue)
            .bind(state.as_str())
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn count_by_state(pool: &SqlitePool, queue: &str) -> AppResult<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT state, COUNT(*)
            FROM batch_jobs
            WHERE queue = ?
            GROUP BY state
            "#,
        )
        .bind(queue)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            match JobState::from_str(&state) {
                Some(JobState::Waiting) => counts.waiting = count,
                Some(JobState::Active) => counts.active = count,
                Some(JobState::Delayed) => counts.delayed = count,
                Some(JobState::Completed) => counts.completed = count,
                Some(JobState::Failed) => counts.failed = count,
                None => tracing::warn!("Ignoring jobs with unknown state '{}'", state),
            }
        }

        Ok(counts)
    }

    /// Atomically claim the next due job of `queue` and move it to `active`.
    ///
    /// Returns `None` when nothing is due or the queue is paused. Progress is
    /// reset because it is only monotonic within a single attempt.
    pub async fn claim_next(
        pool: &SqlitePool,
        queue: &str,
        lock_expires_at: NaiveDateTime,
    ) -> AppResult<Option<BatchJob>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE batch_jobs
            SET state = 'active',
                progress = 0,
                processed_at = ?,
                lock_expires_at = ?,
                updated_at = ?
            WHERE id = (
                SELECT id FROM batch_jobs
                WHERE queue = ?
                  AND state IN ('waiting', 'delayed')
                  AND available_at <= ?
                  AND NOT EXISTS (
                      SELECT 1 FROM queue_state
                      WHERE queue_state.queue = ? AND queue_state.paused = 1
                  )
                ORDER BY priority DESC, available_at ASC, created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        sqlx::query_as::<_, BatchJob>(&sql)
            .bind(now)
            .bind(lock_expires_at)
            .bind(now)
            .bind(queue)
            .bind(now)
            .bind(queue)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Raise the progress of an active job and renew its lock.
    ///
    /// Lower values than the stored one are ignored. Returns the stored
    /// progress, or `None` when the job is no longer active.
    pub async fn update_progress(
        pool: &SqlitePool,
        id: &str,
        progress: i64,
        lock_expires_at: NaiveDateTime,
    ) -> AppResult<Option<i64>> {
        let now = Utc::now().naive_utc();
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE batch_jobs
            SET progress = MAX(progress, ?),
                lock_expires_at = ?,
                updated_at = ?
            WHERE id = ? AND state = 'active'
            RETURNING progress
            "#,
        )
        .bind(progress.clamp(0, 100))
        .bind(lock_expires_at)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Move an active job to `completed` with its return value.
    pub async fn mark_completed(
        pool: &SqlitePool,
        id: &str,
        result_json: &str,
    ) -> AppResult<BatchJob> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE batch_jobs
            SET state = 'completed',
                attempts_made = attempts_made + 1,
                result_json = ?,
                lock_expires_at = NULL,
                finished_at = ?,
                updated_at = ?
            WHERE id = ? AND state = 'active'
            RETURNING {JOB_COLUMNS}
            "#
        );

        sqlx::query_as::<_, BatchJob>(&sql)
            .bind(result_json)
            .bind(now)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::Conflict(format!("Job {} is not active", id)))
    }

    /// Record a failed attempt. If attempts remain the job is parked in
    /// `delayed` until `retry_at`; otherwise it becomes terminally `failed`.
    ///
    /// Returns the updated job row.
    pub async fn register_failed_attempt(
        pool: &SqlitePool,
        id: &str,
        failed_reason: &str,
        retry_at: NaiveDateTime,
    ) -> AppResult<BatchJob> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE batch_jobs
            SET attempts_made = attempts_made + 1,
                failed_reason = ?,
                lock_expires_at = NULL,
                state = CASE WHEN attempts_made + 1 >= max_attempts THEN 'failed' ELSE 'delayed' END,
                available_at = CASE WHEN attempts_made + 1 >= max_attempts THEN available_at ELSE ? END,
                finished_at = CASE WHEN attempts_made + 1 >= max_attempts THEN ? ELSE NULL END,
                updated_at = ?
            WHERE id = ? AND state = 'active'
            RETURNING {JOB_COLUMNS}
            "#
        );

        sqlx::query_as::<_, BatchJob>(&sql)
            .bind(failed_reason)
            .bind(retry_at)
            .bind(now)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::Conflict(format!("Job {} is not active", id)))
    }

    /// Recover active jobs whose lock expired.
    ///
    /// Each recovery counts as a stall. Jobs still within `max_stalled` go
    /// back to `waiting`; the others become terminally `failed`. Returns the
    /// ids with the state each one was moved to.
    pub async fn recover_stalled(
        pool: &SqlitePool,
        queue: &str,
        max_stalled: i64,
    ) -> AppResult<Vec<(String, String)>> {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, (String, String)>(
            r#"
            UPDATE batch_jobs
            SET stalled_count = stalled_count + 1,
                state = CASE WHEN stalled_count + 1 > ? THEN 'failed' ELSE 'waiting' END,
                failed_reason = CASE WHEN stalled_count + 1 > ? THEN ? ELSE failed_reason END,
                finished_at = CASE WHEN stalled_count + 1 > ? THEN ? ELSE finished_at END,
                lock_expires_at = NULL,
                updated_at = ?
            WHERE queue = ?
              AND state = 'active'
              AND lock_expires_at IS NOT NULL
              AND lock_expires_at < ?
            RETURNING id, state
            "#,
        )
        .bind(max_stalled)
        .bind(max_stalled)
        .bind(STALLED_LIMIT_REASON)
        .bind(max_stalled)
        .bind(now)
        .bind(now)
        .bind(queue)
        .bind(now)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Delete a job unless it is active. Returns `false` when no row matched.
    pub async fn delete_inactive(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM batch_jobs WHERE id = ? AND state != 'active'")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete jobs of `queue` in a terminal `state` that finished before `cutoff`.
    /// Returns the removed ids.
    pub async fn delete_finished_before(
        pool: &SqlitePool,
        queue: &str,
        state: JobState,
        cutoff: NaiveDateTime,
    ) -> AppResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            DELETE FROM batch_jobs
            WHERE queue = ?
              AND state = ?
              AND finished_at IS NOT NULL
              AND finished_at < ?
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(state.as_str())
        .bind(cutoff)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Overwrite the finish time of a job. Used to age jobs in tests.
    #[cfg(test)]
    pub async fn set_finished_at(
        pool: &SqlitePool,
        id: &str,
        finished_at: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query("UPDATE batch_jobs SET finished_at = ? WHERE id = ?")
            .bind(finished_at)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn new_job(id: &str, priority: i64) -> CreateBatchJob {
        CreateBatchJob {
            id: id.to_string(),
            queue: "q".to_string(),
            name: "send-batch-emails".to_string(),
            batch_id: id.to_string(),
            data_json: r#"{"batchId":"b","emails":[]}"#.to_string(),
            priority,
            max_attempts: 2,
            backoff_ms: 0,
        }
    }

    fn lease() -> NaiveDateTime {
        Utc::now().naive_utc() + chrono::Duration::minutes(5)
    }

    #[tokio::test]
    async fn duplicate_job_id_is_a_conflict() {
        let pool = test_pool().await;
        BatchJobRepository::create(&pool, new_job("a", 0)).await.unwrap();

        match BatchJobRepository::create(&pool, new_job("a", 0)).await {
            Err(AppError::Conflict(msg)) => assert!(msg.contains("a")),
            other => panic!("expected Conflict, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn claims_by_priority_then_age() {
        let pool = test_pool().await;
        BatchJobRepository::create(&pool, new_job("low", 0)).await.unwrap();
        BatchJobRepository::create(&pool, new_job("high", 5)).await.unwrap();
        BatchJobRepository::create(&pool, new_job("low-2", 0)).await.unwrap();

        let order: Vec<String> = [
            BatchJobRepository::claim_next(&pool, "q", lease()).await.unwrap(),
            BatchJobRepository::claim_next(&pool, "q", lease()).await.unwrap(),
            BatchJobRepository::claim_next(&pool, "q", lease()).await.unwrap(),
        ]
        .into_iter()
        .map(|job| job.expect("job claimed").id)
        .collect();

        assert_eq!(order, vec!["high", "low", "low-2"]);
        assert!(BatchJobRepository::claim_next(&pool, "q", lease())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let pool = test_pool().await;
        BatchJobRepository::create(&pool, new_job("p", 0)).await.unwrap();
        BatchJobRepository::claim_next(&pool, "q", lease()).await.unwrap();

        assert_eq!(
            BatchJobRepository::update_progress(&pool, "p", 60, lease()).await.unwrap(),
            Some(60)
        );
        assert_eq!(
            BatchJobRepository::update_progress(&pool, "p", 40, lease()).await.unwrap(),
            Some(60)
        );
    }

    #[tokio::test]
    async fn failed_attempts_delay_then_fail() {
        let pool = test_pool().await;
        BatchJobRepository::create(&pool, new_job("f", 0)).await.unwrap();
        let retry_at = Utc::now().naive_utc();

        BatchJobRepository::claim_next(&pool, "q", lease()).await.unwrap();
        let job = BatchJobRepository::register_failed_attempt(&pool, "f", "boom", retry_at)
            .await
            .unwrap();
        assert_eq!(job.job_state(), Some(JobState::Delayed));
        assert_eq!(job.attempts_made, 1);
        assert!(job.finished_at.is_none());

        BatchJobRepository::claim_next(&pool, "q", lease()).await.unwrap();
        let job = BatchJobRepository::register_failed_attempt(&pool, "f", "boom", retry_at)
            .await
            .unwrap();
        assert_eq!(job.job_state(), Some(JobState::Failed));
        assert_eq!(job.attempts_made, 2);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn active_jobs_cannot_be_deleted() {
        let pool = test_pool().await;
        BatchJobRepository::create(&pool, new_job("d", 0)).await.unwrap();
        BatchJobRepository::claim_next(&pool, "q", lease()).await.unwrap();

        assert!(!BatchJobRepository::delete_inactive(&pool, "d").await.unwrap());
        assert!(BatchJobRepository::find_by_id(&pool, "d").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_locks_are_requeued() {
        let pool = test_pool().await;
        BatchJobRepository::create(&pool, new_job("s", 0)).await.unwrap();
        let expired = Utc::now().naive_utc() - chrono::Duration::seconds(1);
        BatchJobRepository::claim_next(&pool, "q", expired).await.unwrap();

        let recovered = BatchJobRepository::recover_stalled(&pool, "q", 1).await.unwrap();
        assert_eq!(recovered, vec![("s".to_string(), "waiting".to_string())]);

        let job = BatchJobRepository::find_by_id(&pool, "s").await.unwrap().unwrap();
        assert_eq!(job.job_state(), Some(JobState::Waiting));
        assert_eq!(job.stalled_count, 1);
        assert_eq!(job.attempts_made, 0);
    }

    #[tokio::test]
    async fn repeatedly_stalled_job_is_failed() {
        let pool = test_pool().await;
        BatchJobRepository::create(&pool, new_job("crashy", 0)).await.unwrap();
        let expired = Utc::now().naive_utc() - chrono::Duration::seconds(1);

        BatchJobRepository::claim_next(&pool, "q", expired).await.unwrap();
        BatchJobRepository::recover_stalled(&pool, "q", 1).await.unwrap();
        BatchJobRepository::claim_next(&pool, "q", expired).await.unwrap();
        let recovered = BatchJobRepository::recover_stalled(&pool, "q", 1).await.unwrap();
        assert_eq!(recovered, vec![("crashy".to_string(), "failed".to_string())]);

        let job = BatchJobRepository::find_by_id(&pool, "crashy").await.unwrap().unwrap();
        assert_eq!(job.job_state(), Some(JobState::Failed));
        assert_eq!(job.stalled_count, 2);
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_LIMIT_REASON));
        assert!(job.finished_at.is_some());
        assert!(BatchJobRepository::claim_next(&pool, "q", lease()).await.unwrap().is_none());
    }
}
