//! Shared bootstrap for database-backed tests.
//!
//! These suites run against a provisioned Postgres named by `DATABASE_URL`
//! and are `#[ignore]`d by default; run them with `cargo test -- --ignored`.

use sl_storage::{create_pool, migrations, DbPool};
use uuid::Uuid;

pub async fn pool() -> DbPool {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must point at a test database for ignored tests");
    let pool = create_pool(&url, 10, 1).await.expect("connect");
    migrations::run_migrations(&pool).await.expect("migrate");
    pool
}

/// Workflow slugs are unique per test so suites can share one database.
pub fn unique_slug(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}
