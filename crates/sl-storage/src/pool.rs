//! Database connection pool

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;

/// Database pool wrapper
pub type DbPool = PgPool;

/// Statement timeout applied to every connection. Bounds the scheduler's
/// single round-trips so a contended transaction cannot hang a worker.
const STATEMENT_TIMEOUT_SECS: u64 = 15;

/// Create a new database connection pool
pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
    min_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(database_url)?.options([(
        "statement_timeout",
        format!("{}s", STATEMENT_TIMEOUT_SECS),
    )]);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(min_connections)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(60 * 10))
        .connect_with(options)
        .await
}
