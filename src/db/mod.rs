pub mod models;
pub mod repository;

pub use models::*;
pub use repository::*;

/// Single-connection in-memory database with all migrations applied.
///
/// An in-memory SQLite database lives and dies with its connection, so the
/// pool is pinned to one connection that is never recycled.
#[cfg(test)]
pub async fn test_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");

    pool
}
