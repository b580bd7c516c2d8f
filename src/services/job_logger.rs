use serde_json::Value;
use sqlx::SqlitePool;

use crate::db::JobLogRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
        }
    }
}

/// Audit trail of one job.
///
/// Every entry goes to the tracing stream and to the job's durable log.
/// Writing never fails from the caller's point of view: storage errors are
/// downgraded to a warning.
#[derive(Clone)]
pub struct JobLogger {
    pool: SqlitePool,
    job_id: String,
}

impl JobLogger {
    pub fn new(pool: SqlitePool, job_id: impl Into<String>) -> Self {
        Self {
            pool,
            job_id: job_id.into(),
        }
    }

    pub async fn info(&self, message: &str, data: Option<&Value>) {
        self.log(LogLevel::Info, message, data).await;
    }

    pub async fn warn(&self, message: &str, data: Option<&Value>) {
        self.log(LogLevel::Warn, message, data).await;
    }

    pub async fn error(&self, message: &str, data: Option<&Value>) {
        self.log(LogLevel::Error, message, data).await;
    }

    pub async fn success(&self, message: &str, data: Option<&Value>) {
        self.log(LogLevel::Success, message, data).await;
    }

    pub async fn log(&self, level: LogLevel, message: &str, data: Option<&Value>) {
        let line = match data {
            Some(data) => format!("[{}] {} {}", level.as_str().to_uppercase(), message, data),
            None => format!("[{}] {}", level.as_str().to_uppercase(), message),
        };

        match level {
            LogLevel::Info | LogLevel::Success => {
                tracing::info!(job_id = %self.job_id, "{}", line)
            }
            LogLevel::Warn => tracing::warn!(job_id = %self.job_id, "{}", line),
            LogLevel::Error => tracing::error!(job_id = %self.job_id, "{}", line),
        }

        if let Err(e) =
            JobLogRepository::append(&self.pool, &self.job_id, level.as_str(), &line).await
        {
            tracing::warn!("Failed to persist log line for job {}: {}", self.job_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn entries_are_persisted_in_order() {
        let pool = test_pool().await;
        let logger = JobLogger::new(pool.clone(), "job-1");

        logger.info("Processing batch", None).await;
        logger
            .warn("Slow relay", Some(&serde_json::json!({ "ms": 900 })))
            .await;
        logger.success("Done", None).await;

        let lines = JobLogRepository::list_for_job(&pool, "job-1").await.unwrap();
        let levels: Vec<_> = lines.iter().map(|l| l.level.as_str()).collect();
        assert_eq!(levels, vec!["info", "warn", "success"]);
        assert_eq!(lines[0].message, "[INFO] Processing batch");
        assert_eq!(lines[1].message, r#"[WARN] Slow relay {"ms":900}"#);
    }

    #[tokio::test]
    async fn storage_failure_is_swallowed() {
        let pool = test_pool().await;
        sqlx::query("DROP TABLE job_logs").execute(&pool).await.unwrap();

        let logger = JobLogger::new(pool, "job-2");
        logger.error("Relay down", None).await;
    }
}
