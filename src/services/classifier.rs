//! Decides whether a finished batch is a success or a terminal failure.
//!
//! Per-message errors never escape the batch processor; this module is the
//! only place where they escalate, as a `BatchFailure` that drives the
//! queue's retry and backoff.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::services::processor::{ProcessingResult, SendFailure};

/// Number of per-message errors copied into a failure payload.
pub const ERROR_SAMPLE_SIZE: usize = 10;

/// Thresholds applied to every completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePolicy {
    /// Fail when every message of a non-empty batch failed.
    pub fail_on_all_failed: bool,
    /// Fail when nothing was sent from a non-empty batch.
    pub fail_on_zero_sent: bool,
    /// Fail when `failed / total` is strictly above this fraction.
    pub failure_threshold: f64,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            fail_on_all_failed: true,
            fail_on_zero_sent: true,
            failure_threshold: 0.8,
        }
    }
}

impl FailurePolicy {
    pub fn new(
        fail_on_all_failed: bool,
        fail_on_zero_sent: bool,
        failure_threshold: f64,
    ) -> AppResult<Self> {
        let policy = Self {
            fail_on_all_failed,
            fail_on_zero_sent,
            failure_threshold,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(AppError::Validation(format!(
                "failureThreshold must be within [0, 1], got {}",
                self.failure_threshold
            )));
        }
        Ok(())
    }
}

/// Which rule rejected a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AllFailed,
    ZeroSent,
    ThresholdExceeded,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::AllFailed => "all messages failed",
            FailureReason::ZeroSent => "no message was sent",
            FailureReason::ThresholdExceeded => "failure rate above threshold",
        };
        f.write_str(text)
    }
}

/// Rules are checked in a fixed order; the first match names the reason.
pub fn failure_reason(result: &ProcessingResult, policy: &FailurePolicy) -> Option<FailureReason> {
    if result.total == 0 {
        return None;
    }
    if policy.fail_on_all_failed && result.failed == result.total {
        return Some(FailureReason::AllFailed);
    }
    if policy.fail_on_zero_sent && result.sent == 0 {
        return Some(FailureReason::ZeroSent);
    }
    if result.failure_rate() > policy.failure_threshold {
        return Some(FailureReason::ThresholdExceeded);
    }
    None
}

pub fn should_fail(result: &ProcessingResult, policy: &FailurePolicy) -> bool {
    failure_reason(result, policy).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Structured error raised for a rejected batch. Stored as the job's failed
/// reason, so it is what operators see for every failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error(
    "batch {batch_id} failed: {reason} ({failed} of {total} messages failed)",
    failed = .stats.failed,
    total = .stats.total
)]
pub struct BatchFailure {
    pub batch_id: String,
    pub reason: FailureReason,
    pub stats: BatchStats,
    pub failure_rate_percent: f64,
    /// First `ERROR_SAMPLE_SIZE` per-message errors, in message order
    pub errors: Vec<SendFailure>,
    pub total_error_count: usize,
    pub duration: String,
    pub policy: FailurePolicy,
}

/// Accept the batch or build the failure payload that rejects it.
pub fn classify(
    batch_id: &str,
    result: &ProcessingResult,
    policy: &FailurePolicy,
) -> Result<(), BatchFailure> {
    let Some(reason) = failure_reason(result, policy) else {
        return Ok(());
    };

    Err(BatchFailure {
        batch_id: batch_id.to_string(),
        reason,
        stats: BatchStats {
            total: result.total,
            sent: result.sent,
            failed: result.failed,
            skipped: result.skipped,
        },
        failure_rate_percent: (result.failure_rate() * 10_000.0).round() / 100.0,
        errors: result.errors.iter().take(ERROR_SAMPLE_SIZE).cloned().collect(),
        total_error_count: result.errors.len(),
        duration: result.duration_display(),
        policy: *policy,
    })
}
