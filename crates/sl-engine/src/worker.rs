//! Task executor / worker loop
//!
//! A worker is one independent agent against one workflow's queue: poll,
//! claim a batch, run the step handlers concurrently on isolated activities,
//! report each outcome back to the scheduler, repeat until the watched run is
//! terminal or the caller's patience runs out. Workers share nothing
//! in-process; any number may attach to the same run.

use crate::outcome::{run_contained, TaskOutcome};
use serde_json::Value;
use sl_core::config::WorkerConfig;
use sl_core::{Error, Result};
use sl_dag::Flow;
use sl_storage::models::{ClaimedTask, RunStatus};
use sl_storage::{scheduler, DbPool, Queue, QueueMessage, RunsRepo, TaskMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What a bounded worker invocation observed.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The run reached `completed`; carries the run output.
    Completed(Value),
    /// The caller's overall timeout elapsed; the run is still live and other
    /// workers may finish it.
    InProgress,
}

/// Worker-loop tuning. Defaults mirror [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Upper bound on messages per poll and on in-worker parallelism.
    pub batch_size: usize,
    /// Long-poll ceiling per loop iteration.
    pub max_poll: Duration,
    /// Sleep between re-checks within a poll cycle.
    pub poll_interval: Duration,
    /// Time a claimer owns a message.
    pub visibility_timeout: Duration,
    /// Hard per-task deadline.
    pub task_timeout: Duration,
    /// Overall patience; `None` runs until the run is terminal, a finite
    /// value returns `InProgress` and leaves the run to other workers.
    pub timeout: Option<Duration>,
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_poll: Duration::from_secs(config.max_poll_seconds),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_seconds),
            task_timeout: Duration::from_millis(config.task_timeout_ms),
            timeout: None,
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// A worker process attached to one workflow's queue.
pub struct Worker {
    pool: DbPool,
    queue: Queue,
    flow: Arc<Flow>,
    worker_id: String,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(pool: DbPool, flow: Arc<Flow>) -> Self {
        Self {
            queue: Queue::new(pool.clone()),
            pool,
            flow,
            worker_id: Uuid::new_v4().to_string(),
            options: WorkerOptions::default(),
        }
    }

    /// Stable-unique identity recorded as `claimed_by`; defaults to a fresh
    /// UUID per worker.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Drive the workflow queue until `run_id` reaches a terminal state or
    /// the configured overall timeout elapses.
    ///
    /// Infrastructure faults are logged and retried on the next iteration;
    /// user-logic faults never surface here, they become `fail_task` calls.
    /// A batch where scheduler reporting failed for more than half of the
    /// claimed tasks surfaces as [`Error::BatchFailure`] so callers can back
    /// off.
    #[instrument(skip(self), fields(workflow_slug = %self.flow.slug(), worker_id = %self.worker_id))]
    pub async fn run(&self, run_id: Uuid) -> Result<RunOutcome> {
        let runs = RunsRepo::new(self.pool.clone());
        let deadline = self.options.timeout.map(|patience| Instant::now() + patience);

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    info!(%run_id, "Overall timeout elapsed; leaving the run in progress");
                    return Ok(RunOutcome::InProgress);
                }
            }

            let max_poll = match deadline {
                Some(d) => self
                    .options
                    .max_poll
                    .min(d.saturating_duration_since(Instant::now())),
                None => self.options.max_poll,
            };

            let messages: Vec<QueueMessage<TaskMessage>> = match self
                .queue
                .read_with_poll(
                    self.flow.slug(),
                    self.options.visibility_timeout,
                    self.options.batch_size,
                    max_poll,
                    self.options.poll_interval,
                )
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(%run_id, error = %e, "Queue poll failed; retrying");
                    tokio::time::sleep(self.options.poll_interval).await;
                    continue;
                }
            };

            if messages.is_empty() {
                match runs.get(run_id).await {
                    Ok(Some(run)) => match run.status {
                        RunStatus::Completed => {
                            return Ok(RunOutcome::Completed(run.output.unwrap_or(Value::Null)))
                        }
                        RunStatus::Failed => {
                            return Err(Error::run_failed(
                                run.error_message.unwrap_or_else(|| "run failed".to_string()),
                            ))
                        }
                        RunStatus::Started => continue,
                    },
                    Ok(None) => {
                        return Err(Error::NotFound {
                            entity: "run",
                            id: run_id.to_string(),
                        })
                    }
                    Err(e) => {
                        warn!(%run_id, error = %e, "Run status check failed; retrying");
                        continue;
                    }
                }
            }

            let msg_ids: Vec<i64> = messages.iter().map(|m| m.msg_id).collect();
            let tasks = match scheduler::start_tasks(
                &self.pool,
                self.flow.slug(),
                &msg_ids,
                &self.worker_id,
            )
            .await
            {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(%run_id, error = %e, "start_tasks failed; messages will redeliver");
                    continue;
                }
            };

            if tasks.is_empty() {
                // Every message lost its claim race; the winners will ack.
                continue;
            }

            let failures = self.execute_batch(tasks).await?;
            if let Some((failed, total)) = failures {
                return Err(Error::BatchFailure { failed, total });
            }
        }
    }

    /// Run one claimed batch concurrently and report every outcome.
    /// Parallelism is bounded by `batch_size` because a batch never exceeds
    /// it and each task gets exactly one activity.
    async fn execute_batch(&self, tasks: Vec<ClaimedTask>) -> Result<Option<(usize, usize)>> {
        let total = tasks.len();
        let mut activities: JoinSet<(ClaimedTask, TaskOutcome)> = JoinSet::new();

        for task in tasks {
            match self.flow.resolve(&task.step_slug) {
                Ok(handler) => {
                    let deadline = self.task_deadline(&task.step_slug);
                    let input = task.input.clone();
                    activities.spawn(async move {
                        let outcome = run_contained(handler, input, deadline).await;
                        (task, outcome)
                    });
                }
                Err(e) => {
                    // Unknown slug: the flow this worker carries cannot run
                    // the task. Burn the attempt so the run fails loudly
                    // instead of spinning.
                    let outcome = TaskOutcome::Failure(e.to_string());
                    activities.spawn(async move { (task, outcome) });
                }
            }
        }

        let mut scheduler_failures = 0usize;
        while let Some(joined) = activities.join_next().await {
            let (task, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Activity join failed");
                    scheduler_failures += 1;
                    continue;
                }
            };
            if !self.report(&task, outcome).await {
                scheduler_failures += 1;
            }
        }

        if scheduler_failures * 2 > total {
            return Ok(Some((scheduler_failures, total)));
        }
        Ok(None)
    }

    /// Report one task outcome to the scheduler. Returns `false` on an
    /// execution-layer failure (the scheduler call itself failed); the
    /// message will reappear via its visibility timeout and be re-processed.
    async fn report(&self, task: &ClaimedTask, outcome: TaskOutcome) -> bool {
        let result = match &outcome {
            TaskOutcome::Success(value) => scheduler::complete_task(
                &self.pool,
                task.run_id,
                &task.step_slug,
                task.task_index,
                value.clone(),
            )
            .await
            .map(|_| ()),
            failure => {
                let error_text = failure
                    .error_text()
                    .unwrap_or_else(|| "unknown failure".to_string());
                scheduler::fail_task(
                    &self.pool,
                    task.run_id,
                    &task.step_slug,
                    task.task_index,
                    &error_text,
                )
                .await
                .map(|_| ())
            }
        };

        match result {
            Ok(()) => {
                debug!(
                    run_id = %task.run_id,
                    step_slug = %task.step_slug,
                    task_index = task.task_index,
                    worker_id = %self.worker_id,
                    "Task outcome reported"
                );
                true
            }
            Err(e) => {
                warn!(
                    run_id = %task.run_id,
                    step_slug = %task.step_slug,
                    task_index = task.task_index,
                    worker_id = %self.worker_id,
                    error = %e,
                    "Scheduler report failed; task will redeliver"
                );
                false
            }
        }
    }

    /// Effective hard deadline for one task: the worker's `task_timeout`
    /// tightened by the step's own `timeout_seconds` when that is shorter.
    fn task_deadline(&self, step_slug: &str) -> Duration {
        match self.flow.meta(step_slug) {
            Ok(meta) => self
                .options
                .task_timeout
                .min(Duration::from_secs(meta.timeout_seconds.max(0) as u64)),
            Err(_) => self.options.task_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_contract_values() {
        let options = WorkerOptions::default();
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.max_poll, Duration::from_secs(5));
        assert_eq!(options.poll_interval, Duration::from_millis(200));
        assert_eq!(options.visibility_timeout, Duration::from_secs(30));
        assert_eq!(options.task_timeout, Duration::from_millis(30_000));
        assert!(options.timeout.is_none());
    }
}
