use chrono::NaiveDateTime;
use sqlx::SqlitePool;

use crate::db::models::IdempotencyRecord;
use crate::error::{AppError, AppResult};

/// Storage for sent-message markers.
///
/// Every statement is atomic on its own; no caller needs a lock. Expired rows
/// are treated as absent until the sweep deletes them.
pub struct IdempotencyRepository;

impl IdempotencyRepository {
    /// The marker stored under `key`, if it has not expired yet.
    pub async fn find_live(
        pool: &SqlitePool,
        key: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<IdempotencyRecord>> {
        sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT key, sent_at, expires_at
            FROM idempotency_keys
            WHERE key = ? AND expires_at > ?
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn exists_live(pool: &SqlitePool, key: &str, now: NaiveDateTime) -> AppResult<bool> {
        Ok(Self::find_live(pool, key, now).await?.is_some())
    }

    /// Set the marker unless a live one exists. An expired marker is replaced.
    ///
    /// Returns `true` when this call wrote the marker (first writer wins).
    pub async fn insert_if_absent(
        pool: &SqlitePool,
        key: &str,
        sent_at: NaiveDateTime,
        expires_at: NaiveDateTime,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, sent_at, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                sent_at = excluded.sent_at,
                expires_at = excluded.expires_at
            WHERE idempotency_keys.expires_at <= excluded.sent_at
            "#,
        )
        .bind(key)
        .bind(sent_at)
        .bind(expires_at)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete every key starting with `prefix`, live or not.
    pub async fn delete_by_prefix(pool: &SqlitePool, prefix: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE substr(key, 1, length(?)) = ?")
            .bind(prefix)
            .bind(prefix)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    pub async fn delete_expired(pool: &SqlitePool, now: NaiveDateTime) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= ?")
            .bind(now)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    pub async fn count_live(pool: &SqlitePool, prefix: &str, now: NaiveDateTime) -> AppResult<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM idempotency_keys
            WHERE substr(key, 1, length(?)) = ? AND expires_at > ?
            "#,
        )
        .bind(prefix)
        .bind(prefix)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Size of the whole database file in bytes.
    pub async fn database_size_bytes(pool: &SqlitePool) -> AppResult<i64> {
        sqlx::query_scalar(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn expired_marker_is_replaced() {
        let pool = test_pool().await;
        let now = Utc::now().naive_utc();

        let stale = now - Duration::hours(2);
        assert!(
            IdempotencyRepository::insert_if_absent(&pool, "k", stale, stale + Duration::hours(1))
                .await
                .unwrap()
        );
        assert!(IdempotencyRepository::find_live(&pool, "k", now).await.unwrap().is_none());

        assert!(
            IdempotencyRepository::insert_if_absent(&pool, "k", now, now + Duration::hours(1))
                .await
                .unwrap()
        );
        let record = IdempotencyRepository::find_live(&pool, "k", now).await.unwrap().unwrap();
        assert_eq!(record.sent_at, now);
    }

    #[tokio::test]
    async fn prefix_operations_ignore_other_keys() {
        let pool = test_pool().await;
        let now = Utc::now().naive_utc();
        let later = now + Duration::hours(1);

        for key in ["email:sent:a", "email:sent:b", "other:c"] {
            IdempotencyRepository::insert_if_absent(&pool, key, now, later)
                .await
                .unwrap();
        }

        assert_eq!(
            IdempotencyRepository::count_live(&pool, "email:sent:", now).await.unwrap(),
            2
        );
        assert_eq!(
            IdempotencyRepository::delete_by_prefix(&pool, "email:sent:").await.unwrap(),
            2
        );
        assert!(IdempotencyRepository::exists_live(&pool, "other:c", now).await.unwrap());
        assert!(IdempotencyRepository::database_size_bytes(&pool).await.unwrap() > 0);
    }
}
