pub mod batch_job_repository;
pub mod idempotency_repository;
pub mod job_log_repository;
pub mod queue_state_repository;

pub use batch_job_repository::{BatchJobRepository, STALLED_LIMIT_REASON};
pub use idempotency_repository::IdempotencyRepository;
pub use job_log_repository::JobLogRepository;
pub use queue_state_repository::QueueStateRepository;
