//! Executor facade
//!
//! The public entry points of the engine. Stateless: every call goes to the
//! database, so any number of facades and workers can serve the same runs.

use crate::initializer::start_run;
use crate::worker::{RunOutcome, Worker, WorkerOptions};
use crate::db_err;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sl_core::{Clock, Error, IdGen, Result, SystemClock, UuidGen};
use sl_dag::Flow;
use sl_storage::models::{RunStatus, StepStatus};
use sl_storage::{DbPool, RunsRepo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;
use uuid::Uuid;

/// Snapshot of one run and its steps.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusReport {
    pub run_id: Uuid,
    pub state: RunStatus,
    pub error: Option<String>,
    pub steps: Vec<StepReport>,
}

/// Snapshot of one step within a run.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub slug: String,
    pub state: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub error: Option<String>,
}

/// Aggregate run metrics. Missing data yields zeros rather than errors.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunMetrics {
    pub execution_time_ms: i64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub throughput_steps_per_sec: f64,
}

/// Public entry point for starting and driving workflow runs.
#[derive(Clone)]
pub struct Executor {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    options: WorkerOptions,
}

impl Executor {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGen),
            options: WorkerOptions::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGen>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_worker_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Initialize a run and leave it for workers to drive. Returns the run id.
    #[instrument(skip(self, flow, input), fields(workflow_slug = %flow.slug()))]
    pub async fn start(&self, flow: &Flow, input: Value) -> Result<Uuid> {
        start_run(
            &self.pool,
            flow,
            input,
            self.clock.as_ref(),
            self.ids.as_ref(),
        )
        .await
    }

    /// Initialize a run and drive it in-process until terminal. Returns the
    /// run output, or `RunFailed` with the terminal error message.
    #[instrument(skip(self, flow, input), fields(workflow_slug = %flow.slug()))]
    pub async fn execute(&self, flow: &Flow, input: Value) -> Result<Value> {
        let run_id = self.start(flow, input).await?;
        let worker = Worker::new(self.pool.clone(), Arc::new(flow.clone()))
            .with_options(self.options.clone());
        match worker.run(run_id).await? {
            RunOutcome::Completed(output) => Ok(output),
            RunOutcome::InProgress => Err(Error::Timeout),
        }
    }

    /// Wait for a run driven by other workers, polling its status until it
    /// turns terminal or `deadline` elapses.
    #[instrument(skip(self))]
    pub async fn wait(
        &self,
        run_id: Uuid,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<Value> {
        let runs = RunsRepo::new(self.pool.clone());
        let limit = Instant::now() + deadline;

        loop {
            let run = runs
                .get(run_id)
                .await
                .map_err(db_err)?
                .ok_or(Error::NotFound {
                    entity: "run",
                    id: run_id.to_string(),
                })?;

            match run.status {
                RunStatus::Completed => return Ok(run.output.unwrap_or(Value::Null)),
                RunStatus::Failed => {
                    return Err(Error::run_failed(
                        run.error_message.unwrap_or_else(|| "run failed".to_string()),
                    ))
                }
                RunStatus::Started => {
                    if Instant::now() + poll_interval > limit {
                        return Err(Error::Timeout);
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    /// Snapshot of a run and its per-step states.
    #[instrument(skip(self))]
    pub async fn status(&self, run_id: Uuid) -> Result<RunStatusReport> {
        let runs = RunsRepo::new(self.pool.clone());
        let run = runs
            .get(run_id)
            .await
            .map_err(db_err)?
            .ok_or(Error::NotFound {
                entity: "run",
                id: run_id.to_string(),
            })?;

        let steps = runs
            .list_step_states(run_id)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(|state| StepReport {
                slug: state.step_slug,
                state: state.status,
                started_at: state.started_at,
                completed_at: state.completed_at,
                failed_at: state.failed_at,
                attempts: state.attempts_count,
                error: state.error_message,
            })
            .collect();

        Ok(RunStatusReport {
            run_id,
            state: run.status,
            error: run.error_message,
            steps,
        })
    }

    /// Aggregate metrics for a run. A missing run yields all-zero metrics.
    #[instrument(skip(self))]
    pub async fn metrics(&self, run_id: Uuid) -> Result<RunMetrics> {
        let runs = RunsRepo::new(self.pool.clone());
        let Some(run) = runs.get(run_id).await.map_err(db_err)? else {
            return Ok(RunMetrics::default());
        };

        let counts = runs.step_counts(run_id).await.map_err(db_err)?;

        let end = run
            .completed_at
            .or(run.failed_at)
            .unwrap_or_else(|| self.clock.now());
        let execution_time_ms = (end - run.started_at).num_milliseconds().max(0);

        let total = counts.total_steps as f64;
        let (success_rate, error_rate) = if counts.total_steps > 0 {
            (
                counts.completed_steps as f64 / total,
                counts.failed_steps as f64 / total,
            )
        } else {
            (0.0, 0.0)
        };

        let elapsed_secs = execution_time_ms as f64 / 1000.0;
        let throughput_steps_per_sec = if elapsed_secs > 0.0 {
            counts.completed_steps as f64 / elapsed_secs
        } else {
            0.0
        };

        Ok(RunMetrics {
            execution_time_ms,
            success_rate,
            error_rate,
            throughput_steps_per_sec,
        })
    }
}
