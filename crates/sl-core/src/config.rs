//! Configuration management for Sluice

use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Environment (development, staging, production)
    #[serde(default = "default_env")]
    pub env: String,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Worker-loop configuration
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Recognized worker-loop options and their defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Upper bound on messages per poll and on in-worker parallelism.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Long-poll ceiling per loop iteration, in seconds.
    #[serde(default = "default_max_poll_seconds")]
    pub max_poll_seconds: u64,

    /// Sleep between re-checks within a poll cycle, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time a claimer owns a message, in seconds.
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u64,

    /// Hard per-task deadline, in milliseconds.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_poll_seconds: default_max_poll_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_seconds: default_visibility_timeout_seconds(),
            task_timeout_ms: default_task_timeout_ms(),
        }
    }
}

// Default value functions
fn default_env() -> String {
    "development".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    5
}
fn default_batch_size() -> usize {
    10
}
fn default_max_poll_seconds() -> u64 {
    5
}
fn default_poll_interval_ms() -> u64 {
    200
}
fn default_visibility_timeout_seconds() -> u64 {
    30
}
fn default_task_timeout_ms() -> u64 {
    30_000
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .set_default("env", "development")?
            // Load from environment with SLUICE_ prefix
            .add_source(
                config::Environment::with_prefix("SLUICE")
                    .separator("_")
                    .try_parsing(true),
            )
            // Database from DATABASE_URL
            .add_source(
                config::Environment::default()
                    .prefix("DATABASE")
                    .separator("_"),
            )
            // Worker tuning from WORKER_
            .add_source(
                config::Environment::default()
                    .prefix("WORKER")
                    .separator("_")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_defaults_match_contract() {
        let worker = WorkerConfig::default();
        assert_eq!(worker.batch_size, 10);
        assert_eq!(worker.max_poll_seconds, 5);
        assert_eq!(worker.poll_interval_ms, 200);
        assert_eq!(worker.visibility_timeout_seconds, 30);
        assert_eq!(worker.task_timeout_ms, 30_000);
    }
}
