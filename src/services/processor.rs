//! Sequential delivery of one batch.
//!
//! Messages are handled strictly in submission order, one at a time: errors
//! are recorded in message order and progress only moves forward. A failing
//! message never aborts the batch; it is counted and the loop moves on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::EmailMessage;
use crate::services::idempotency::{idempotency_key, IdempotencyService};
use crate::services::mail::{validate_email, MailTransport};

/// One message that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFailure {
    pub recipient: String,
    pub reason: String,
}

/// Aggregate outcome of a batch. `sent + skipped + failed == total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub total: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<SendFailure>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProcessingResult {
    /// `failed / total`, 0 for an empty batch.
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }

    pub fn duration_display(&self) -> String {
        format!("{:.2}s", self.duration_ms as f64 / 1000.0)
    }
}

/// Receives the batch's completion percentage after every message.
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn on_progress(&self, percent: u8);
}

/// Percentage of `processed` out of `total`, rounded half up.
pub fn progress_percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((processed as f64 / total as f64) * 100.0).round() as u8
}

enum MessageOutcome {
    Sent,
    Skipped,
    Failed(String),
}

pub struct BatchProcessor {
    transport: Arc<dyn MailTransport>,
    idempotency: IdempotencyService,
    throttle: Duration,
}

impl BatchProcessor {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        idempotency: IdempotencyService,
        throttle: Duration,
    ) -> Self {
        Self {
            transport,
            idempotency,
            throttle,
        }
    }

    pub fn idempotency(&self) -> &IdempotencyService {
        &self.idempotency
    }

    async fn process_message(&self, message: &EmailMessage) -> MessageOutcome {
        let key = idempotency_key(message);

        let violations = validate_email(message);
        if !violations.is_empty() {
            return MessageOutcome::Failed(format!("Invalid message: {}", violations.join(", ")));
        }

        if self.idempotency.is_already_sent(&key).await {
            tracing::debug!(
                "Message to {} already sent recently, skipping",
                message.to.email
            );
            return MessageOutcome::Skipped;
        }

        match self.transport.send(message).await {
            Ok(()) => {
                self.idempotency.mark_sent(&key).await;
                tracing::debug!("Message sent to {}", message.to.email);
                MessageOutcome::Sent
            }
            Err(e) => {
                tracing::warn!("Failed to send message to {}: {}", message.to.email, e);
                MessageOutcome::Failed(e.to_string())
            }
        }
    }

    /// Deliver `messages` in order, reporting progress after each one.
    pub async fn process_batch(
        &self,
        messages: &[EmailMessage],
        progress: &dyn ProgressObserver,
    ) -> ProcessingResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let total = messages.len();

        let mut result = ProcessingResult {
            total,
            sent: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
            duration_ms: 0,
            started_at,
            finished_at: started_at,
        };

        for (index, message) in messages.iter().enumerate() {
            match self.process_message(message).await {
                MessageOutcome::Sent => result.sent += 1,
                MessageOutcome::Skipped => result.skipped += 1,
                MessageOutcome::Failed(reason) => {
                    result.failed += 1;
                    result.errors.push(SendFailure {
                        recipient: message.to.email.clone(),
                        reason,
                    });
                }
            }

            progress.on_progress(progress_percent(index + 1, total)).await;

            if index + 1 < total && !self.throttle.is_zero() {
                tokio::time::sleep(self.throttle).await;
            }
        }

        result.duration_ms = clock.elapsed().as_millis() as u64;
        result.finished_at = Utc::now();
        result
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Collects every reported percentage.
    #[derive(Default)]
    pub struct ProgressLog(pub Mutex<Vec<u8>>);

    impl ProgressLog {
        pub fn values(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProgressObserver for ProgressLog {
        async fn on_progress(&self, percent: u8) {
            self.0.lock().unwrap().push(percent);
        }
    }
}
