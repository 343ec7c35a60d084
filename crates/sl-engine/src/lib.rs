//! Sluice Execution Engine
//!
//! Drives durable workflow runs end to end:
//! - Run initializer: persist a run and enqueue its root tasks
//! - Worker loop: poll, claim, execute user steps, report outcomes
//! - Executor facade: `execute` / `start` / `wait` / `status` / `metrics`
//!
//! Any number of worker processes may attach to the same run; all
//! coordination goes through the database and its embedded queue.

pub mod executor;
pub mod initializer;
pub mod outcome;
pub mod worker;

pub use executor::{Executor, RunMetrics, RunStatusReport, StepReport};
pub use initializer::start_run;
pub use outcome::TaskOutcome;
pub use worker::{RunOutcome, Worker, WorkerOptions};

use sl_core::Error;

/// Map a driver error into the engine's transient-backend taxonomy.
pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}
