//! Database migration runner

use sqlx::PgPool;
use tracing::info;

/// Apply the embedded Sluice schema — the workflow tables and the queue
/// tables — to the target database.
///
/// Migrations are embedded at compile time from `db/migrations` (the path is
/// relative to this crate's Cargo.toml) and applied in order;
/// already-applied versions are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let migrator = sqlx::migrate!("../../db/migrations");
    let schema_version = migrator.migrations.last().map(|m| m.version).unwrap_or(0);

    migrator.run(pool).await?;

    info!(
        embedded_migrations = migrator.migrations.len(),
        schema_version,
        "Sluice schema is up to date"
    );

    Ok(())
}
