pub mod licenses;

use std::future::Future;
use std::time::Duration;

use licensa_common::error::{LicensaError, LicensaResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a Postgres connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> LicensaResult<PgPool> {
    tracing::info!("connecting to database");
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .map_err(map_sqlx_error)
}

/// Map a driver error onto the error taxonomy the recovery policy understands.
pub fn map_sqlx_error(err: sqlx::Error) -> LicensaError {
    match err {
        sqlx::Error::PoolTimedOut => LicensaError::Timeout("database pool timeout".to_string()),
        sqlx::Error::Io(e) => LicensaError::Connection(format!("database connection: {e}")),
        sqlx::Error::PoolClosed => {
            LicensaError::Connection("database connection pool closed".to_string())
        }
        sqlx::Error::RowNotFound => LicensaError::NotFound("row not found".to_string()),
        other => LicensaError::Database(other.to_string()),
    }
}

/// Bound a store round-trip; an elapsed deadline surfaces as `LicensaError::Timeout`.
pub async fn run_with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> LicensaResult<T>
where
    F: Future<Output = LicensaResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(LicensaError::Timeout(format!(
            "{operation} timeout after {}ms",
            limit.as_millis()
        ))),
    }
}
