//! Runs batch jobs: worker loop, stalled-job recovery, retention sweep and
//! graceful drain.
//!
//! `EmailProcessor` is constructed once at startup and shared as an
//! `Arc`; its lifecycle is driven explicitly with `initialize` and `stop`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::WorkerConfig;
use crate::db::{BatchJob, CacheStats, JobState, QueueCounts};
use crate::error::{AppError, AppResult};
use crate::services::classifier::{classify, BatchFailure, FailurePolicy};
use crate::services::idempotency::IdempotencyService;
use crate::services::job_logger::JobLogger;
use crate::services::processor::{BatchProcessor, ProcessingResult, ProgressObserver};
use crate::services::queue::EmailQueue;

/// Terminal value stored on a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: String,
    #[serde(flatten)]
    pub result: ProcessingResult,
    pub duration: String,
}

/// Why an attempt failed. Both kinds go through the retry path.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Batch(#[from] BatchFailure),

    #[error(transparent)]
    Infrastructure(#[from] AppError),
}

impl JobError {
    /// Failed reason stored on the job: the structured payload when there is one.
    pub fn to_reason(&self) -> String {
        match self {
            JobError::Batch(failure) => {
                serde_json::to_string(failure).unwrap_or_else(|_| failure.to_string())
            }
            JobError::Infrastructure(e) => e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainOutcome {
    pub drained: bool,
    pub remaining_active: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub completed_removed: usize,
    pub failed_removed: usize,
    pub expired_keys_removed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStats {
    pub is_processing: bool,
    pub queue: QueueCounts,
    pub cache: CacheStats,
}

/// Pushes batch progress into the job row.
struct JobProgress<'a> {
    queue: &'a EmailQueue,
    job_id: &'a str,
}

#[async_trait::async_trait]
impl<'a> ProgressObserver for JobProgress<'a> {
    async fn on_progress(&self, percent: u8) {
        if let Err(e) = self.queue.update_progress(self.job_id, percent).await {
            tracing::warn!("Failed to update progress of job {}: {}", self.job_id, e);
        }
    }
}

pub struct EmailProcessor {
    queue: Arc<EmailQueue>,
    batch: BatchProcessor,
    policy: RwLock<FailurePolicy>,
    worker: WorkerConfig,
    processing: AtomicBool,
    /// Jobs claimed by this process and not settled yet. Also serializes
    /// claiming with the local pause taken by `stop`.
    owned: Mutex<HashSet<String>>,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl EmailProcessor {
    pub fn new(
        queue: Arc<EmailQueue>,
        batch: BatchProcessor,
        policy: FailurePolicy,
        worker: WorkerConfig,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            queue,
            batch,
            policy: RwLock::new(policy),
            worker,
            processing: AtomicBool::new(false),
            owned: Mutex::new(HashSet::new()),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<EmailQueue> {
        &self.queue
    }

    pub fn idempotency(&self) -> &IdempotencyService {
        self.batch.idempotency()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub async fn failure_policy(&self) -> FailurePolicy {
        *self.policy.read().await
    }

    /// Replace the policy used for every batch classified from now on.
    pub async fn set_failure_policy(&self, policy: FailurePolicy) -> AppResult<()> {
        policy.validate()?;
        *self.policy.write().await = policy;
        tracing::info!(
            "Failure policy updated: fail_on_all_failed={}, fail_on_zero_sent={}, failure_threshold={}",
            policy.fail_on_all_failed,
            policy.fail_on_zero_sent,
            policy.failure_threshold
        );
        Ok(())
    }

    /// Start the worker and maintenance loops.
    pub async fn initialize(self: &Arc<Self>) {
        if self.processing.swap(true, Ordering::SeqCst) {
            tracing::warn!("Email processor already initialized");
            return;
        }
        self.queue.resume_local();

        let mut handles = self.handles.lock().await;
        handles.push(self.spawn_worker());
        handles.push(self.spawn_stalled_check());
        handles.push(self.spawn_retention_sweep());

        tracing::info!(
            "Email processor started on queue {} (concurrency {})",
            self.queue.name(),
            self.worker.concurrency
        );
    }

    fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let permits = Arc::new(Semaphore::new(self.worker.concurrency.max(1) as usize));

        tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                match this.claim().await {
                    Ok(Some(job)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.run_job(job).await {
                                tracing::error!("Failed to settle job: {}", e);
                            }
                            drop(permit);
                        });
                        continue;
                    }
                    Ok(None) => drop(permit),
                    Err(e) => {
                        drop(permit);
                        tracing::warn!("Failed to claim next job: {}", e);
                    }
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(this.worker.poll_interval()) => {}
                }
            }
            tracing::info!("Email worker shutting down");
        })
    }

    fn spawn_stalled_check(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(this.worker.stalled_check_interval()) => {}
                }
                if let Err(e) = this.queue.recover_stalled().await {
                    tracing::warn!("Stalled job check failed: {}", e);
                }
            }
        })
    }

    fn spawn_retention_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Retention sweep shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(this.worker.cleanup_interval()) => {}
                }
                if let Err(e) = this.cleanup_old_jobs().await {
                    tracing::error!("Retention sweep failed: {}", e);
                }
            }
        })
    }

    /// Handler for one attempt of a batch job.
    pub async fn process_job(&self, job: &BatchJob) -> Result<BatchReport, JobError> {
        let logger = JobLogger::new(self.queue.pool().clone(), job.id.clone());
        let data = match job.data() {
            Ok(data) => data,
            Err(e) => {
                logger.error(&format!("Unreadable job payload: {}", e), None).await;
                return Err(e.into());
            }
        };

        logger
            .info(
                &format!(
                    "Processing batch {} with {} emails (attempt {}/{})",
                    data.batch_id,
                    data.emails.len(),
                    job.attempts_made + 1,
                    job.max_attempts
                ),
                None,
            )
            .await;

        let observer = JobProgress {
            queue: &self.queue,
            job_id: &job.id,
        };
        let result = self.batch.process_batch(&data.emails, &observer).await;

        logger
            .info(
                &format!("Batch {} processed in {}", data.batch_id, result.duration_display()),
                Some(&serde_json::json!({
                    "total": result.total,
                    "sent": result.sent,
                    "skipped": result.skipped,
                    "failed": result.failed,
                })),
            )
            .await;
        if !result.errors.is_empty() {
            logger
                .warn(
                    &format!("{} messages could not be sent", result.errors.len()),
                    serde_json::to_value(&result.errors).ok().as_ref(),
                )
                .await;
        }

        let policy = self.failure_policy().await;
        if let Err(failure) = classify(&data.batch_id, &result, &policy) {
            logger
                .error(
                    &failure.to_string(),
                    serde_json::to_value(&failure).ok().as_ref(),
                )
                .await;
            return Err(failure.into());
        }

        logger
            .success(&format!("Batch {} completed", data.batch_id), None)
            .await;
        Ok(BatchReport {
            batch_id: data.batch_id,
            duration: result.duration_display(),
            result,
        })
    }

    /// Claim the next job on behalf of this process.
    async fn claim(&self) -> AppResult<Option<BatchJob>> {
        let mut owned = self.owned.lock().await;
        let job = self.queue.claim_next().await?;
        if let Some(job) = &job {
            owned.insert(job.id.clone());
        }
        Ok(job)
    }

    /// Run the handler and store its outcome. Returns the settled job row.
    async fn run_job(&self, job: BatchJob) -> AppResult<BatchJob> {
        let id = job.id.clone();
        let settled = self.settle(job).await;
        self.owned.lock().await.remove(&id);
        settled
    }

    async fn settle(&self, job: BatchJob) -> AppResult<BatchJob> {
        match self.process_job(&job).await {
            Ok(report) => self.queue.complete(&job.id, &report).await,
            Err(e) => {
                let settled = self.queue.fail(&job, &e.to_reason()).await?;
                if settled.job_state() == Some(JobState::Failed) {
                    tracing::error!(
                        "Job {} failed permanently after {} attempts: {}",
                        settled.id,
                        settled.attempts_made,
                        e
                    );
                }
                Ok(settled)
            }
        }
    }

    /// Claim and run one job in the calling task.
    #[cfg(test)]
    pub async fn process_next(&self) -> AppResult<Option<BatchJob>> {
        match self.claim().await? {
            Some(job) => self.run_job(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Retention sweep: old terminal jobs and expired idempotency keys.
    pub async fn cleanup_old_jobs(&self) -> AppResult<CleanupReport> {
        let completed = self
            .queue
            .clean(self.worker.retention_completed(), JobState::Completed)
            .await?;
        let failed = self
            .queue
            .clean(self.worker.retention_failed(), JobState::Failed)
            .await?;
        let expired_keys = match self.idempotency().purge_expired().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Failed to purge expired idempotency keys: {}", e);
                0
            }
        };

        let report = CleanupReport {
            completed_removed: completed.len(),
            failed_removed: failed.len(),
            expired_keys_removed: expired_keys,
        };
        tracing::info!(
            "Retention sweep removed {} completed jobs, {} failed jobs, {} expired keys",
            report.completed_removed,
            report.failed_removed,
            report.expired_keys_removed
        );
        Ok(report)
    }

    pub async fn stats(&self) -> AppResult<ProcessorStats> {
        Ok(ProcessorStats {
            is_processing: self.is_processing(),
            queue: self.queue.counts().await?,
            cache: self.idempotency().cache_stats().await,
        })
    }

    /// Wait until no job claimed by this process is active or `timeout` elapses.
    pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
        let deadline = Instant::now() + timeout;
        let mut remaining = 0;

        loop {
            match self.queue.get_active().await {
                Ok(active) => {
                    let owned = self.owned.lock().await;
                    remaining = active.iter().filter(|job| owned.contains(&job.id)).count();
                }
                Err(e) => tracing::warn!("Failed to read active jobs while draining: {}", e),
            }

            if remaining == 0 {
                return DrainOutcome {
                    drained: true,
                    remaining_active: 0,
                };
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    "Drain timed out with {} active jobs still running",
                    remaining
                );
                return DrainOutcome {
                    drained: false,
                    remaining_active: remaining,
                };
            }

            tracing::info!("Waiting for {} active jobs to finish", remaining);
            tokio::select! {
                _ = self.queue.job_settled() => {}
                _ = tokio::time::sleep(self.worker.drain_poll_interval()) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Stop taking new jobs, wait (bounded) for active ones, then stop the loops.
    pub async fn stop(&self) -> DrainOutcome {
        tracing::info!("Stopping email processor");
        {
            let _claims = self.owned.lock().await;
            self.queue.pause_local();
        }

        let outcome = self.drain(self.worker.drain_timeout()).await;

        let _ = self.shutdown.send(());
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!("Email processor task ended abnormally: {}", e);
            }
        }
        self.processing.store(false, Ordering::SeqCst);

        tracing::info!(
            "Email processor stopped (drained: {}, still active: {})",
            outcome.drained,
            outcome.remaining_active
        );
        outcome
    }
}
