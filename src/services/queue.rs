//! Durable batch job queue on top of the `batch_jobs` table.
//!
//! The database row is the single source of truth for a job's state and
//! progress. `EmailQueue` only adds the policy around it (job options, pause
//! flags, lease handling) and publishes lifecycle events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Notify};

use crate::config::QueueConfig;
use crate::db::{
    BatchJob, BatchJobData, BatchJobRepository, CreateBatchJob, EmailMessage, JobLogEntry,
    JobLogRepository, JobState, QueueCounts, QueueStateRepository, STALLED_LIMIT_REASON,
};
use crate::error::{AppError, AppResult};

/// Largest batch accepted for a single job.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Name of the job type handled by the email processor.
pub const SEND_BATCH_JOB: &str = "send-batch-emails";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Defaults applied to every job added to the queue.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Duration,
    pub lock_duration: Duration,
    pub max_stalled_count: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(5000),
            lock_duration: Duration::from_secs(300),
            max_stalled_count: 1,
        }
    }
}

impl From<&QueueConfig> for JobOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            backoff: config.backoff(),
            lock_duration: config.lock_duration(),
            max_stalled_count: config.max_stalled_count,
        }
    }
}

/// Lifecycle notifications published by the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum QueueEvent {
    Waiting {
        job_id: String,
    },
    Active {
        job_id: String,
    },
    Progress {
        job_id: String,
        progress: i64,
    },
    Completed {
        job_id: String,
    },
    Failed {
        job_id: String,
        reason: String,
        attempts_made: i64,
        will_retry: bool,
    },
    Stalled {
        job_id: String,
    },
    Removed {
        job_id: String,
    },
    Paused,
    Resumed,
    Cleaned {
        state: JobState,
        count: usize,
    },
}

/// `batch-<epoch millis>-<8 hex chars>`
pub fn generate_batch_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("batch-{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

pub struct EmailQueue {
    pool: SqlitePool,
    name: String,
    options: JobOptions,
    events: broadcast::Sender<QueueEvent>,
    /// Set while this process drains; other processes keep claiming.
    local_pause: AtomicBool,
    settled: Notify,
}

impl EmailQueue {
    pub fn new(pool: SqlitePool, name: impl Into<String>, options: JobOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pool,
            name: name.into(),
            options,
            events,
            local_pause: AtomicBool::new(false),
            settled: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscriber is not an error.
        let _ = self.events.send(event);
    }

    /// Resolves the next time an active job leaves the `active` state.
    pub async fn job_settled(&self) {
        self.settled.notified().await;
    }

    fn lease(&self) -> chrono::NaiveDateTime {
        Utc::now().naive_utc() + chrono_duration(self.options.lock_duration)
    }

    /// Persist a new batch job in `waiting` state.
    pub async fn enqueue(
        &self,
        batch_id: Option<String>,
        messages: Vec<EmailMessage>,
        priority: i64,
    ) -> AppResult<BatchJob> {
        if messages.is_empty() {
            return Err(AppError::BadRequest(
                "A batch must contain at least one message".to_string(),
            ));
        }
        if messages.len() > MAX_BATCH_SIZE {
            return Err(AppError::Conflict(format!(
                "Batch of {} messages exceeds the limit of {}",
                messages.len(),
                MAX_BATCH_SIZE
            )));
        }

        let batch_id = batch_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_batch_id);
        let total = messages.len();
        let data = BatchJobData {
            batch_id: batch_id.clone(),
            emails: messages,
        };

        let job = BatchJobRepository::create(
            &self.pool,
            CreateBatchJob {
                id: batch_id.clone(),
                queue: self.name.clone(),
                name: SEND_BATCH_JOB.to_string(),
                batch_id,
                data_json: serde_json::to_string(&data)?,
                priority,
                max_attempts: i64::from(self.options.attempts),
                backoff_ms: self.options.backoff.as_millis() as i64,
            },
        )
        .await?;

        tracing::info!(
            "Batch {} enqueued with {} messages (priority {})",
            job.id,
            total,
            priority
        );
        self.emit(QueueEvent::Waiting {
            job_id: job.id.clone(),
        });
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> AppResult<Option<BatchJob>> {
        let job = BatchJobRepository::find_by_id(&self.pool, job_id).await?;
        Ok(job.filter(|job| job.queue == self.name))
    }

    pub async fn get_jobs(&self, state: JobState) -> AppResult<Vec<BatchJob>> {
        BatchJobRepository::list_by_state(&self.pool, &self.name, state).await
    }

    pub async fn get_active(&self) -> AppResult<Vec<BatchJob>> {
        self.get_jobs(JobState::Active).await
    }

    pub async fn get_waiting(&self) -> AppResult<Vec<BatchJob>> {
        self.get_jobs(JobState::Waiting).await
    }

    pub async fn get_completed(&self) -> AppResult<Vec<BatchJob>> {
        self.get_jobs(JobState::Completed).await
    }

    pub async fn get_failed(&self) -> AppResult<Vec<BatchJob>> {
        self.get_jobs(JobState::Failed).await
    }

    pub async fn get_delayed(&self) -> AppResult<Vec<BatchJob>> {
        self.get_jobs(JobState::Delayed).await
    }

    pub async fn counts(&self) -> AppResult<QueueCounts> {
        BatchJobRepository::count_by_state(&self.pool, &self.name).await
    }

    pub async fn job_logs(&self, job_id: &str) -> AppResult<Vec<JobLogEntry>> {
        JobLogRepository::list_for_job(&self.pool, job_id).await
    }

    /// Delete a job that is not running. Active jobs cannot be cancelled.
    pub async fn remove_job(&self, job_id: &str) -> AppResult<()> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

        if job.job_state() == Some(JobState::Active) {
            return Err(AppError::Conflict(format!(
                "Job {} is active and cannot be removed",
                job_id
            )));
        }

        // The job may have been claimed since it was read.
        if !BatchJobRepository::delete_inactive(&self.pool, job_id).await? {
            return Err(AppError::Conflict(format!(
                "Job {} is active and cannot be removed",
                job_id
            )));
        }
        JobLogRepository::delete_for_job(&self.pool, job_id).await?;

        tracing::info!("Job {} removed", job_id);
        self.emit(QueueEvent::Removed {
            job_id: job_id.to_string(),
        });
        Ok(())
    }

    /// Stop every worker of this queue from starting new jobs.
    pub async fn pause(&self) -> AppResult<()> {
        QueueStateRepository::set_paused(&self.pool, &self.name, true).await?;
        tracing::info!("Queue {} paused", self.name);
        self.emit(QueueEvent::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> AppResult<()> {
        QueueStateRepository::set_paused(&self.pool, &self.name, false).await?;
        tracing::info!("Queue {} resumed", self.name);
        self.emit(QueueEvent::Resumed);
        Ok(())
    }

    /// Stop only this process from starting new jobs.
    pub fn pause_local(&self) {
        if !self.local_pause.swap(true, Ordering::SeqCst) {
            tracing::info!("Queue {} paused locally", self.name);
            self.emit(QueueEvent::Paused);
        }
    }

    pub fn resume_local(&self) {
        if self.local_pause.swap(false, Ordering::SeqCst) {
            tracing::info!("Queue {} resumed locally", self.name);
            self.emit(QueueEvent::Resumed);
        }
    }

    pub fn is_paused_locally(&self) -> bool {
        self.local_pause.load(Ordering::SeqCst)
    }

    pub async fn is_paused(&self) -> AppResult<bool> {
        if self.is_paused_locally() {
            return Ok(true);
        }
        QueueStateRepository::is_paused(&self.pool, &self.name).await
    }

    /// Move the next due job to `active` under a fresh lease.
    pub async fn claim_next(&self) -> AppResult<Option<BatchJob>> {
        if self.is_paused_locally() {
            return Ok(None);
        }

        let job = BatchJobRepository::claim_next(&self.pool, &self.name, self.lease()).await?;
        if let Some(job) = &job {
            tracing::debug!(
                "Job {} claimed (attempt {}/{})",
                job.id,
                job.attempts_made + 1,
                job.max_attempts
            );
            self.emit(QueueEvent::Active {
                job_id: job.id.clone(),
            });
        }
        Ok(job)
    }

    /// Record progress of an active job and renew its lease.
    /// Returns the stored progress, `None` once the job is no longer active.
    pub async fn update_progress(&self, job_id: &str, progress: u8) -> AppResult<Option<i64>> {
        let stored = BatchJobRepository::update_progress(
            &self.pool,
            job_id,
            i64::from(progress),
            self.lease(),
        )
        .await?;

        if let Some(progress) = stored {
            self.emit(QueueEvent::Progress {
                job_id: job_id.to_string(),
                progress,
            });
        }
        Ok(stored)
    }

    pub async fn complete<T: Serialize>(&self, job_id: &str, result: &T) -> AppResult<BatchJob> {
        let result_json = serde_json::to_string(result)?;
        let job = BatchJobRepository::mark_completed(&self.pool, job_id, &result_json).await;
        self.settled.notify_waiters();

        let job = job?;
        self.emit(QueueEvent::Completed {
            job_id: job.id.clone(),
        });
        Ok(job)
    }

    /// Record a failed attempt: retried after the job's backoff while attempts
    /// remain, terminally `failed` otherwise.
    pub async fn fail(&self, job: &BatchJob, reason: &str) -> AppResult<BatchJob> {
        let retry_at =
            Utc::now().naive_utc() + chrono::Duration::milliseconds(job.backoff_ms.max(0));
        let updated =
            BatchJobRepository::register_failed_attempt(&self.pool, &job.id, reason, retry_at)
                .await;
        self.settled.notify_waiters();

        let updated = updated?;
        let will_retry = updated.job_state() == Some(JobState::Delayed);
        self.emit(QueueEvent::Failed {
            job_id: updated.id.clone(),
            reason: reason.to_string(),
            attempts_made: updated.attempts_made,
            will_retry,
        });
        Ok(updated)
    }

    /// Put active jobs with an expired lease back in `waiting`, or fail the
    /// ones that stalled more than `max_stalled_count` times.
    /// Returns the ids of every stalled job.
    pub async fn recover_stalled(&self) -> AppResult<Vec<String>> {
        let recovered = BatchJobRepository::recover_stalled(
            &self.pool,
            &self.name,
            i64::from(self.options.max_stalled_count),
        )
        .await?;
        if !recovered.is_empty() {
            self.settled.notify_waiters();
        }

        let mut ids = Vec::with_capacity(recovered.len());
        for (id, state) in recovered {
            self.emit(QueueEvent::Stalled { job_id: id.clone() });
            if JobState::from_str(&state) == Some(JobState::Failed) {
                tracing::error!("Job {} stalled too many times, marked as failed", id);
                if let Some(job) = BatchJobRepository::find_by_id(&self.pool, &id).await? {
                    self.emit(QueueEvent::Failed {
                        job_id: id.clone(),
                        reason: STALLED_LIMIT_REASON.to_string(),
                        attempts_made: job.attempts_made,
                        will_retry: false,
                    });
                }
            } else {
                tracing::warn!("Job {} stalled, moved back to waiting", id);
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Evict `state` jobs that finished more than `grace` ago, with their logs.
    pub async fn clean(&self, grace: Duration, state: JobState) -> AppResult<Vec<String>> {
        if !state.is_terminal() {
            return Err(AppError::Validation(format!(
                "Only terminal jobs can be cleaned, got '{}'",
                state.as_str()
            )));
        }

        let cutoff = Utc::now().naive_utc() - chrono_duration(grace);
        let ids =
            BatchJobRepository::delete_finished_before(&self.pool, &self.name, state, cutoff)
                .await?;
        for id in &ids {
            JobLogRepository::delete_for_job(&self.pool, id).await?;
        }

        if !ids.is_empty() {
            self.emit(QueueEvent::Cleaned {
                state,
                count: ids.len(),
            });
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::services::mail::testing::message;

    fn options(attempts: u32) -> JobOptions {
        JobOptions {
            attempts,
            backoff: Duration::ZERO,
            lock_duration: Duration::from_secs(60),
            max_stalled_count: 1,
        }
    }

    async fn queue(attempts: u32) -> EmailQueue {
        EmailQueue::new(test_pool().await, "email-batch-queue", options(attempts))
    }

    fn batch(n: usize) -> Vec<EmailMessage> {
        (0..n)
            .map(|i| message(&format!("user{}@example.com", i), "Hello"))
            .collect()
    }

    #[test]
    fn generated_batch_ids_have_expected_shape() {
        let id = generate_batch_id();
        let parts: Vec<_> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "batch");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert_ne!(id, generate_batch_id());
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_and_oversized_batches() {
        let queue = queue(3).await;

        assert!(matches!(
            queue.enqueue(None, Vec::new(), 0).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            queue.enqueue(None, batch(MAX_BATCH_SIZE + 1), 0).await,
            Err(AppError::Conflict(_))
        ));
        assert_eq!(queue.counts().await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn enqueue_persists_payload_and_options() {
        let queue = queue(3).await;
        let mut events = queue.subscribe();

        let job = queue
            .enqueue(Some("newsletter-42".to_string()), batch(2), 5)
            .await
            .unwrap();

        assert_eq!(job.id, "newsletter-42");
        assert_eq!(job.job_state(), Some(JobState::Waiting));
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, 5);
        assert_eq!(job.data().unwrap().emails.len(), 2);
        assert_eq!(
            events.try_recv().unwrap(),
            QueueEvent::Waiting {
                job_id: "newsletter-42".to_string()
            }
        );

        assert!(matches!(
            queue.enqueue(Some("newsletter-42".to_string()), batch(1), 0).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn global_pause_stops_claims_until_resumed() {
        let queue = queue(3).await;
        queue.enqueue(None, batch(1), 0).await.unwrap();

        queue.pause().await.unwrap();
        assert!(queue.is_paused().await.unwrap());
        assert!(queue.claim_next().await.unwrap().is_none());

        queue.resume().await.unwrap();
        assert!(queue.claim_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn local_pause_leaves_persisted_flag_alone() {
        let queue = queue(3).await;
        queue.enqueue(None, batch(1), 0).await.unwrap();

        queue.pause_local();
        assert!(queue.is_paused().await.unwrap());
        assert!(!QueueStateRepository::is_paused(queue.pool(), queue.name())
            .await
            .unwrap());
        assert!(queue.claim_next().await.unwrap().is_none());

        queue.resume_local();
        assert!(queue.claim_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn active_job_cannot_be_removed() {
        let queue = queue(3).await;
        let job = queue.enqueue(None, batch(1), 0).await.unwrap();
        queue.claim_next().await.unwrap();

        assert!(matches!(
            queue.remove_job(&job.id).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            queue.remove_job("missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn waiting_job_is_removed_with_its_logs() {
        let queue = queue(3).await;
        let job = queue.enqueue(None, batch(1), 0).await.unwrap();
        JobLogRepository::append(queue.pool(), &job.id, "info", "queued")
            .await
            .unwrap();

        queue.remove_job(&job.id).await.unwrap();

        assert!(queue.get_job(&job.id).await.unwrap().is_none());
        assert!(queue.job_logs(&job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_attempts_retry_until_exhausted() {
        let queue = queue(2).await;
        let mut events = queue.subscribe();
        queue.enqueue(Some("b".to_string()), batch(1), 0).await.unwrap();

        let job = queue.claim_next().await.unwrap().unwrap();
        let job = queue.fail(&job, "relay down").await.unwrap();
        assert_eq!(job.job_state(), Some(JobState::Delayed));
        assert_eq!(queue.get_delayed().await.unwrap().len(), 1);

        let job = queue.claim_next().await.unwrap().unwrap();
        let job = queue.fail(&job, "relay down").await.unwrap();
        assert_eq!(job.job_state(), Some(JobState::Failed));
        assert_eq!(job.failed_reason.as_deref(), Some("relay down"));
        assert!(queue.claim_next().await.unwrap().is_none());

        let failures: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                QueueEvent::Failed { will_retry, .. } => Some(will_retry),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![true, false]);
    }

    #[tokio::test]
    async fn progress_is_reported_for_active_jobs_only() {
        let queue = queue(3).await;
        let job = queue.enqueue(None, batch(1), 0).await.unwrap();

        assert_eq!(queue.update_progress(&job.id, 50).await.unwrap(), None);

        queue.claim_next().await.unwrap();
        assert_eq!(queue.update_progress(&job.id, 50).await.unwrap(), Some(50));

        let completed = queue
            .complete(&job.id, &serde_json::json!({ "sent": 1 }))
            .await
            .unwrap();
        assert_eq!(completed.attempts_made, 1);
        assert_eq!(completed.result().unwrap()["sent"], 1);
        assert_eq!(queue.update_progress(&job.id, 100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn clean_respects_retention_windows() {
        let queue = queue(1).await;
        let now = Utc::now().naive_utc();

        for id in ["old-done", "new-done", "old-failed", "new-failed"] {
            queue.enqueue(Some(id.to_string()), batch(1), 0).await.unwrap();
            let job = queue.claim_next().await.unwrap().unwrap();
            if id.ends_with("done") {
                queue.complete(&job.id, &serde_json::json!({})).await.unwrap();
            } else {
                queue.fail(&job, "boom").await.unwrap();
            }
        }
        let pool = queue.pool();
        BatchJobRepository::set_finished_at(pool, "old-done", now - chrono::Duration::hours(25))
            .await
            .unwrap();
        BatchJobRepository::set_finished_at(pool, "new-done", now - chrono::Duration::hours(23))
            .await
            .unwrap();
        BatchJobRepository::set_finished_at(pool, "old-failed", now - chrono::Duration::hours(49))
            .await
            .unwrap();
        BatchJobRepository::set_finished_at(pool, "new-failed", now - chrono::Duration::hours(30))
            .await
            .unwrap();

        let day = Duration::from_secs(24 * 3600);
        let removed_completed = queue.clean(day, JobState::Completed).await.unwrap();
        let removed_failed = queue.clean(day * 2, JobState::Failed).await.unwrap();

        assert_eq!(removed_completed, vec!["old-done".to_string()]);
        assert_eq!(removed_failed, vec!["old-failed".to_string()]);
        assert!(queue.get_job("new-done").await.unwrap().is_some());
        assert!(queue.get_job("new-failed").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clean_refuses_live_states() {
        let queue = queue(3).await;
        assert!(matches!(
            queue.clean(Duration::ZERO, JobState::Active).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn stalled_jobs_go_back_to_waiting() {
        let pool = test_pool().await;
        let queue = EmailQueue::new(
            pool,
            "q",
            JobOptions {
                lock_duration: Duration::ZERO,
                ..options(3)
            },
        );
        let job = queue.enqueue(None, batch(1), 0).await.unwrap();
        queue.claim_next().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(queue.recover_stalled().await.unwrap(), vec![job.id.clone()]);
        assert_eq!(queue.get_waiting().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn job_stalling_past_the_limit_fails() {
        let pool = test_pool().await;
        let queue = EmailQueue::new(
            pool,
            "q",
            JobOptions {
                lock_duration: Duration::ZERO,
                ..options(3)
            },
        );
        let mut events = queue.subscribe();
        let job = queue.enqueue(None, batch(1), 0).await.unwrap();

        for _ in 0..2 {
            assert!(queue.claim_next().await.unwrap().is_some());
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(queue.recover_stalled().await.unwrap(), vec![job.id.clone()]);
        }

        assert!(queue.claim_next().await.unwrap().is_none());
        let failed = queue.get_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_reason.as_deref(), Some(STALLED_LIMIT_REASON));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen.last(),
            Some(&QueueEvent::Failed {
                job_id: job.id.clone(),
                reason: STALLED_LIMIT_REASON.to_string(),
                attempts_made: 0,
                will_retry: false,
            })
        );
    }
}
