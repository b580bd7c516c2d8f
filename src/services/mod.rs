pub mod classifier;
pub mod email_processor;
pub mod idempotency;
pub mod init;
pub mod job_logger;
pub mod mail;
pub mod processor;
pub mod queue;
