use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::services::classifier::FailurePolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub mail: MailConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub idempotency: IdempotencyConfig,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Comma-separated list of allowed CORS origins. Empty allows none.
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailTransportKind {
    /// POST messages to an HTTP mail relay
    Http,
    /// Only log messages (development)
    Log,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub transport: MailTransportKind,
    /// Relay endpoint, required for the `http` transport.
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub timeout_seconds: u64,
    /// Pause between two sends of the same batch.
    pub throttle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Total attempts per job, first run included.
    pub attempts: u32,
    /// Fixed delay between a failed attempt and its retry.
    pub backoff_ms: u64,
    /// Lease a worker holds on an active job; renewed on every progress update.
    pub lock_seconds: u64,
    /// Times an active job may lose its lease before it is failed outright.
    pub max_stalled_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Whether this process runs the job handler (the HTTP surface always runs).
    pub enabled: bool,
    /// Maximum batch jobs processed at the same time by this process.
    pub concurrency: u32,
    pub poll_interval_ms: u64,
    pub stalled_check_interval_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub retention_completed_hours: u64,
    pub retention_failed_hours: u64,
    pub drain_timeout_seconds: u64,
    pub drain_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    pub ttl_seconds: u64,
}

impl QueueConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_seconds)
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stalled_check_interval(&self) -> Duration {
        Duration::from_secs(self.stalled_check_interval_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn retention_completed(&self) -> Duration {
        Duration::from_secs(self.retention_completed_hours * 60 * 60)
    }

    pub fn retention_failed(&self) -> Duration {
        Duration::from_secs(self.retention_failed_hours * 60 * 60)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

/// Parse an optional variable, falling back to `default` when unset.
/// A set but unparsable value is an error rather than a silent default.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string())),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        let transport = match env::var("MAIL_TRANSPORT") {
            Ok(v) => match v.to_lowercase().as_str() {
                "http" => MailTransportKind::Http,
                "log" => MailTransportKind::Log,
                _ => return Err(ConfigError::InvalidValue("MAIL_TRANSPORT".to_string())),
            },
            Err(_) => defaults.mail.transport,
        };
        let api_url = env::var("MAIL_API_URL").ok();
        if transport == MailTransportKind::Http && api_url.is_none() {
            return Err(ConfigError::MissingEnv("MAIL_API_URL".to_string()));
        }

        let failure_policy = FailurePolicy::new(
            env_bool("FAIL_ON_ALL_FAILED", defaults.failure_policy.fail_on_all_failed)?,
            env_bool("FAIL_ON_ZERO_SENT", defaults.failure_policy.fail_on_zero_sent)?,
            env_parse("FAILURE_THRESHOLD", defaults.failure_policy.failure_threshold)?,
        )
        .map_err(|_| ConfigError::InvalidValue("FAILURE_THRESHOLD".to_string()))?;

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env_parse("PORT", defaults.server.port)?,
                cors_origins: match env::var("CORS_ORIGINS") {
                    Ok(v) => v
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                    Err(_) => defaults.server.cors_origins,
                },
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env_parse(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            mail: MailConfig {
                transport,
                api_url,
                api_token: env::var("MAIL_API_TOKEN").ok(),
                timeout_seconds: env_parse("MAIL_TIMEOUT_SECONDS", defaults.mail.timeout_seconds)?,
                throttle_ms: env_parse("MAIL_THROTTLE_MS", defaults.mail.throttle_ms)?,
            },
            queue: QueueConfig {
                name: env::var("QUEUE_NAME").unwrap_or(defaults.queue.name),
                attempts: env_parse("QUEUE_ATTEMPTS", defaults.queue.attempts)?.max(1),
                backoff_ms: env_parse("QUEUE_BACKOFF_MS", defaults.queue.backoff_ms)?,
                lock_seconds: env_parse("QUEUE_LOCK_SECONDS", defaults.queue.lock_seconds)?,
                max_stalled_count: env_parse(
                    "QUEUE_MAX_STALLED_COUNT",
                    defaults.queue.max_stalled_count,
                )?,
            },
            worker: WorkerConfig {
                enabled: env_bool("WORKER_ENABLED", defaults.worker.enabled)?,
                concurrency: env_parse("WORKER_CONCURRENCY", defaults.worker.concurrency)?.max(1),
                poll_interval_ms: env_parse(
                    "WORKER_POLL_INTERVAL_MS",
                    defaults.worker.poll_interval_ms,
                )?,
                stalled_check_interval_seconds: env_parse(
                    "STALLED_CHECK_INTERVAL_SECONDS",
                    defaults.worker.stalled_check_interval_seconds,
                )?,
                cleanup_interval_seconds: env_parse(
                    "CLEANUP_INTERVAL_SECONDS",
                    defaults.worker.cleanup_interval_seconds,
                )?,
                retention_completed_hours: env_parse(
                    "RETENTION_COMPLETED_HOURS",
                    defaults.worker.retention_completed_hours,
                )?,
                retention_failed_hours: env_parse(
                    "RETENTION_FAILED_HOURS",
                    defaults.worker.retention_failed_hours,
                )?,
                drain_timeout_seconds: env_parse(
                    "DRAIN_TIMEOUT_SECONDS",
                    defaults.worker.drain_timeout_seconds,
                )?,
                drain_poll_interval_ms: env_parse(
                    "DRAIN_POLL_INTERVAL_MS",
                    defaults.worker.drain_poll_interval_ms,
                )?,
            },
            idempotency: IdempotencyConfig {
                ttl_seconds: env_parse("IDEMPOTENCY_TTL_SECONDS", defaults.idempotency.ttl_seconds)?,
            },
            failure_policy,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3333,
                cors_origins: Vec::new(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/batch-mailer.db".to_string(),
                max_connections: 5,
            },
            mail: MailConfig {
                transport: MailTransportKind::Log,
                api_url: None,
                api_token: None,
                timeout_seconds: 30,
                throttle_ms: 100,
            },
            queue: QueueConfig {
                name: "email-batch-queue".to_string(),
                attempts: 3,
                backoff_ms: 5000,
                lock_seconds: 300,
                max_stalled_count: 1,
            },
            worker: WorkerConfig {
                enabled: true,
                concurrency: 1,
                poll_interval_ms: 1000,
                stalled_check_interval_seconds: 30,
                cleanup_interval_seconds: 4 * 60 * 60,
                retention_completed_hours: 24,
                retention_failed_hours: 48,
                drain_timeout_seconds: 30,
                drain_poll_interval_ms: 1000,
            },
            idempotency: IdempotencyConfig { ttl_seconds: 3600 },
            failure_policy: FailurePolicy::default(),
        }
    }
}
