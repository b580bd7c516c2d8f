//! Content-based deduplication of sends.
//!
//! A message's key is derived from its normalized recipient, subject and
//! body only, so the same content to the same recipient collides across
//! batches, jobs and retries. While a live marker exists for a key, the
//! message is skipped.
//!
//! Reads fail open: when the store cannot answer, the message is treated as
//! not yet sent. Availability wins over strict deduplication.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::db::{CacheStats, EmailMessage, IdempotencyRepository};
use crate::error::AppResult;

/// Namespace of sent-message markers inside the key store.
pub const IDEMPOTENCY_PREFIX: &str = "email:sent:";

/// Deterministic content hash of a message (lowercase hex SHA-256).
pub fn idempotency_key(message: &EmailMessage) -> String {
    let content = serde_json::json!({
        "to": message.to.email.trim().to_lowercase(),
        "subject": message.subject.trim(),
        "html": message.body.trim(),
    });

    hex::encode(Sha256::digest(content.to_string().as_bytes()))
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    async fn exists(&self, key: &str) -> AppResult<bool>;

    /// Write the marker with a TTL unless a live one exists.
    /// Returns `true` when this call created it.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> AppResult<bool>;

    async fn clear_all(&self, prefix: &str) -> AppResult<u64>;

    async fn purge_expired(&self) -> AppResult<u64>;

    async fn stats(&self, prefix: &str) -> AppResult<CacheStats>;
}

/// Key store kept in the job database.
#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    pool: SqlitePool,
}

impl SqliteIdempotencyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn exists(&self, key: &str) -> AppResult<bool> {
        IdempotencyRepository::exists_live(&self.pool, key, Utc::now().naive_utc()).await
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        IdempotencyRepository::insert_if_absent(&self.pool, key, now, now + ttl).await
    }

    async fn clear_all(&self, prefix: &str) -> AppResult<u64> {
        IdempotencyRepository::delete_by_prefix(&self.pool, prefix).await
    }

    async fn purge_expired(&self) -> AppResult<u64> {
        IdempotencyRepository::delete_expired(&self.pool, Utc::now().naive_utc()).await
    }

    async fn stats(&self, prefix: &str) -> AppResult<CacheStats> {
        let total_keys =
            IdempotencyRepository::count_live(&self.pool, prefix, Utc::now().naive_utc()).await?;
        let bytes = IdempotencyRepository::database_size_bytes(&self.pool).await?;

        Ok(CacheStats {
            total_keys,
            memory_usage_human: human_bytes(bytes),
        })
    }
}

/// Render a byte count the way cache servers report memory: `512B`, `1.50K`, `2.00M`.
pub fn human_bytes(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["K", "M", "G", "T"];

    if bytes < 1024 {
        return format!("{}B", bytes.max(0));
    }

    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.2}{}", value, unit)
}

/// Store access with the delivery policy applied: fail-open reads,
/// logged-and-swallowed writes.
#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn namespaced(key: &str) -> String {
        format!("{}{}", IDEMPOTENCY_PREFIX, key)
    }

    pub async fn is_already_sent(&self, key: &str) -> bool {
        match self.store.exists(&Self::namespaced(key)).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(
                    "Idempotency check failed for {}, allowing send: {}",
                    key,
                    e
                );
                false
            }
        }
    }

    pub async fn mark_sent(&self, key: &str) {
        match self.store.set_if_absent(&Self::namespaced(key), self.ttl).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Idempotency key {} was already marked", key),
            Err(e) => tracing::warn!("Failed to mark {} as sent: {}", key, e),
        }
    }

    /// Drop every marker. Returns how many were removed.
    pub async fn clear_all(&self) -> AppResult<u64> {
        let removed = self.store.clear_all(IDEMPOTENCY_PREFIX).await?;
        if removed > 0 {
            tracing::info!("Idempotency cache cleared: {} keys removed", removed);
        }
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> AppResult<u64> {
        self.store.purge_expired().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        match self.store.stats(IDEMPOTENCY_PREFIX).await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("Failed to read idempotency cache stats: {}", e);
                CacheStats::unavailable()
            }
        }
    }
}
