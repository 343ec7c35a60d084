//! DAG scheduler operations
//!
//! The four operations that own every atomic state transition of a run:
//! `start_ready_steps`, `start_tasks`, `complete_task`, `fail_task`. Each
//! public entry point runs in a single transaction; the database is the
//! ordering authority. Rows are identified only by
//! `(run_id, step_slug[, task_index])`.
//!
//! Completion cascades here: a finished task may finish its step, which
//! decrements children's `remaining_deps` and the run's `remaining_steps`,
//! awakens newly-ready steps, and may terminate the run.

use crate::models::{ClaimedTask, RunStatus, StepKind};
use crate::pool::DbPool;
use crate::queue::{enqueue_in_tx, TaskMessage};
use serde_json::{json, Value};
use sqlx::{FromRow, PgConnection, Row};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A step transitioned to `started` (or instantly completed) by
/// `start_ready_steps`.
#[derive(Debug, Clone)]
pub struct AwakenedStep {
    pub step_slug: String,
    /// Number of tasks materialized; zero means the step completed on the
    /// spot with an empty output.
    pub task_count: i32,
}

/// Result of `complete_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// The task was not in `started` state; nothing changed. Repeat calls
    /// and reports from superseded claimers land here.
    NoOp,
    Acknowledged {
        step_completed: bool,
        run_completed: bool,
    },
}

/// Result of `fail_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The task was not in `started` state; nothing changed.
    NoOp,
    /// Attempts remain; the task went back to `queued` with a fresh message.
    Requeued { attempts_count: i32 },
    /// Attempts exhausted; task, step and run are now `failed`.
    Failed,
}

#[derive(Debug, FromRow)]
struct ReadyStep {
    workflow_slug: String,
    step_slug: String,
    declared_tasks: Option<i32>,
    step_type: StepKind,
    max_attempts: i32,
}

#[derive(Debug, FromRow)]
struct ParentOutput {
    step_slug: String,
    output: Option<Value>,
}

// =============================================================================
// start_ready_steps
// =============================================================================

/// Awaken every step of `run_id` whose dependencies are all satisfied:
/// materialize its tasks, enqueue one message per task, and cascade through
/// steps that complete instantly (`initial_tasks = 0`). Returns the awakened
/// steps.
#[instrument(skip(pool))]
pub async fn start_ready_steps(
    pool: &DbPool,
    run_id: Uuid,
) -> Result<Vec<AwakenedStep>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let awakened = start_ready_steps_in_tx(&mut *tx, run_id).await?;
    tx.commit().await?;
    Ok(awakened)
}

/// Worklist form of [`start_ready_steps`], composable inside a caller-owned
/// transaction (run initialization, task completion).
pub async fn start_ready_steps_in_tx(
    conn: &mut PgConnection,
    run_id: Uuid,
) -> Result<Vec<AwakenedStep>, sqlx::Error> {
    let run_input: Option<Value> =
        sqlx::query_scalar("SELECT input FROM workflow_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some(run_input) = run_input else {
        return Ok(Vec::new());
    };

    let mut awakened = Vec::new();

    // Awakening a zero-task step completes it on the spot, which can satisfy
    // further dependencies; loop until no step is ready. Every pass moves each
    // selected step out of `created`, so the loop terminates.
    loop {
        let ready: Vec<ReadyStep> = sqlx::query_as(
            r#"
            SELECT s.workflow_slug, s.step_slug,
                   s.initial_tasks AS declared_tasks,
                   d.step_type, d.max_attempts
            FROM workflow_step_states s
            JOIN workflow_steps d
              ON d.workflow_slug = s.workflow_slug AND d.step_slug = s.step_slug
            WHERE s.run_id = $1 AND s.status = 'created' AND s.remaining_deps = 0
            ORDER BY d.step_index
            FOR UPDATE OF s
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *conn)
        .await?;

        if ready.is_empty() {
            break;
        }

        for step in ready {
            let step_awakened = awaken_step(&mut *conn, run_id, &run_input, &step).await?;
            awakened.push(step_awakened);
        }
    }

    Ok(awakened)
}

/// Transition one ready step to `started` (or straight to `completed` when it
/// has no tasks) and enqueue its work.
async fn awaken_step(
    conn: &mut PgConnection,
    run_id: Uuid,
    run_input: &Value,
    step: &ReadyStep,
) -> Result<AwakenedStep, sqlx::Error> {
    let parents: Vec<ParentOutput> = sqlx::query_as(
        r#"
        SELECT p.step_slug, p.output
        FROM workflow_step_dependencies e
        JOIN workflow_step_states p
          ON p.run_id = e.run_id AND p.step_slug = e.depends_on_step
        JOIN workflow_steps pd
          ON pd.workflow_slug = p.workflow_slug AND pd.step_slug = p.step_slug
        WHERE e.run_id = $1 AND e.step_slug = $2
        ORDER BY pd.step_index
        "#,
    )
    .bind(run_id)
    .bind(&step.step_slug)
    .fetch_all(&mut *conn)
    .await?;

    // Map steps fan out over their sole parent's list output; a root map step
    // fans out over the run input itself.
    let map_source: Value = match parents.first() {
        Some(parent) => {
            sl_core::merge::fan_out_source(parent.output.as_ref().unwrap_or(&Value::Null))
        }
        None => sl_core::merge::fan_out_source(run_input),
    };

    let task_count = match step.step_type {
        StepKind::Single => 1,
        StepKind::Map => step.declared_tasks.unwrap_or_else(|| match &map_source {
            Value::Array(items) => items.len() as i32,
            _ => 1,
        }),
    };

    if task_count == 0 {
        sqlx::query(
            "UPDATE workflow_step_states SET initial_tasks = 0 \
             WHERE run_id = $1 AND step_slug = $2",
        )
        .bind(run_id)
        .bind(&step.step_slug)
        .execute(&mut *conn)
        .await?;

        debug!(%run_id, step_slug = %step.step_slug, "Step has no tasks; completing instantly");
        cascade_step_completed(&mut *conn, run_id, &step.step_slug, json!({})).await?;

        return Ok(AwakenedStep {
            step_slug: step.step_slug.clone(),
            task_count: 0,
        });
    }

    sqlx::query(
        r#"
        UPDATE workflow_step_states
        SET status = 'started', started_at = now(),
            initial_tasks = $3, remaining_tasks = $3
        WHERE run_id = $1 AND step_slug = $2
        "#,
    )
    .bind(run_id)
    .bind(&step.step_slug)
    .bind(task_count)
    .execute(&mut *conn)
    .await?;

    // Base input every task of this step sees: run input merged with parent
    // outputs in declaration order (later parent wins on key conflict).
    let contributors: Vec<(&str, &Value)> = match step.step_type {
        StepKind::Single => parents
            .iter()
            .filter_map(|p| p.output.as_ref().map(|o| (p.step_slug.as_str(), o)))
            .collect(),
        // A map task sees only the run input plus its own item.
        StepKind::Map => Vec::new(),
    };
    let base_input = sl_core::merge::merge_outputs(run_input, contributors);

    for task_index in 0..task_count {
        let input = match step.step_type {
            StepKind::Single => base_input.clone(),
            StepKind::Map => {
                sl_core::merge::map_task_input(&base_input, &map_source, task_index as usize)
            }
        };

        let msg_id = enqueue_in_tx(
            &mut *conn,
            &step.workflow_slug,
            &TaskMessage {
                run_id,
                step_slug: step.step_slug.clone(),
                task_index,
            },
        )
        .await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_step_tasks
                (run_id, workflow_slug, step_slug, task_index, input, max_attempts, message_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run_id)
        .bind(&step.workflow_slug)
        .bind(&step.step_slug)
        .bind(task_index)
        .bind(&input)
        .bind(step.max_attempts)
        .bind(msg_id)
        .execute(&mut *conn)
        .await?;
    }

    info!(%run_id, step_slug = %step.step_slug, task_count, "Step started");

    Ok(AwakenedStep {
        step_slug: step.step_slug.clone(),
        task_count,
    })
}

// =============================================================================
// start_tasks
// =============================================================================

/// Claim the tasks carried by `msg_ids` for `worker_id`. Tasks already
/// claimed elsewhere are skipped; only successfully claimed tasks are
/// returned. Claiming increments the task's `attempts_count`.
///
/// A `started` task is claimable through its own message: the queue delivers
/// a message to at most one reader per visibility window, so holding a live
/// delivery for a `started` task means the previous claimer's window expired
/// (worker crash recovery).
#[instrument(skip(pool, msg_ids), fields(messages = msg_ids.len()))]
pub async fn start_tasks(
    pool: &DbPool,
    workflow_slug: &str,
    msg_ids: &[i64],
    worker_id: &str,
) -> Result<Vec<ClaimedTask>, sqlx::Error> {
    if msg_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut tx = pool.begin().await?;

    let claimed: Vec<ClaimedTask> = sqlx::query_as(
        r#"
        UPDATE workflow_step_tasks t
        SET status = 'started', claimed_by = $3, claimed_at = now(),
            started_at = now(), attempts_count = t.attempts_count + 1
        FROM (
            SELECT run_id, step_slug, task_index
            FROM workflow_step_tasks
            WHERE workflow_slug = $1 AND message_id = ANY($2)
              AND status IN ('queued', 'started')
            FOR UPDATE SKIP LOCKED
        ) c
        WHERE t.run_id = c.run_id
          AND t.step_slug = c.step_slug
          AND t.task_index = c.task_index
        RETURNING t.run_id, t.step_slug, t.task_index, t.input
        "#,
    )
    .bind(workflow_slug)
    .bind(msg_ids)
    .bind(worker_id)
    .fetch_all(&mut *tx)
    .await?;

    // Step-level attempt bookkeeping: total claims made per step.
    let mut per_step: HashMap<(Uuid, &str), i32> = HashMap::new();
    for task in &claimed {
        *per_step
            .entry((task.run_id, task.step_slug.as_str()))
            .or_default() += 1;
    }
    for ((run_id, step_slug), count) in per_step {
        sqlx::query(
            "UPDATE workflow_step_states SET attempts_count = attempts_count + $3 \
             WHERE run_id = $1 AND step_slug = $2",
        )
        .bind(run_id)
        .bind(step_slug)
        .bind(count)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    debug!(
        workflow_slug,
        claimed = claimed.len(),
        skipped = msg_ids.len() - claimed.len(),
        "Claimed tasks"
    );
    Ok(claimed)
}

// =============================================================================
// complete_task
// =============================================================================

/// Record a successful task, cascading completion through the DAG. Idempotent
/// by task status: a task not currently `started` makes this a no-op.
#[instrument(skip(pool, output))]
pub async fn complete_task(
    pool: &DbPool,
    run_id: Uuid,
    step_slug: &str,
    task_index: i32,
    output: Value,
) -> Result<CompleteOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let completed = sqlx::query(
        r#"
        UPDATE workflow_step_tasks
        SET status = 'completed', output = $4, completed_at = now()
        WHERE run_id = $1 AND step_slug = $2 AND task_index = $3 AND status = 'started'
        RETURNING message_id
        "#,
    )
    .bind(run_id)
    .bind(step_slug)
    .bind(task_index)
    .bind(&output)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = completed else {
        tx.rollback().await?;
        return Ok(CompleteOutcome::NoOp);
    };
    let message_id: Option<i64> = row.get("message_id");

    let remaining_tasks: Option<i32> = sqlx::query_scalar(
        r#"
        UPDATE workflow_step_states
        SET remaining_tasks = remaining_tasks - 1
        WHERE run_id = $1 AND step_slug = $2 AND remaining_tasks > 0
        RETURNING remaining_tasks
        "#,
    )
    .bind(run_id)
    .bind(step_slug)
    .fetch_optional(&mut *tx)
    .await?;

    let mut step_completed = false;
    let mut run_completed = false;

    if remaining_tasks == Some(0) {
        let step_output = aggregate_step_output(&mut *tx, run_id, step_slug).await?;
        run_completed = cascade_step_completed(&mut *tx, run_id, step_slug, step_output).await?;
        step_completed = true;

        // Children whose last dependency just cleared.
        start_ready_steps_in_tx(&mut *tx, run_id).await?;
    }

    if let Some(msg_id) = message_id {
        sqlx::query("DELETE FROM queue_messages WHERE msg_id = $1")
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    debug!(%run_id, step_slug, task_index, step_completed, run_completed, "Task completed");
    Ok(CompleteOutcome::Acknowledged {
        step_completed,
        run_completed,
    })
}

/// Step output once all tasks are done: the single task's output for `single`
/// steps, the `task_index`-ordered array of task outputs for `map` steps.
async fn aggregate_step_output(
    conn: &mut PgConnection,
    run_id: Uuid,
    step_slug: &str,
) -> Result<Value, sqlx::Error> {
    let output: Option<Value> = sqlx::query_scalar(
        r#"
        SELECT CASE WHEN d.step_type = 'single'
                    THEN (SELECT t.output FROM workflow_step_tasks t
                          WHERE t.run_id = $1 AND t.step_slug = $2 AND t.task_index = 0)
                    ELSE (SELECT COALESCE(jsonb_agg(t.output ORDER BY t.task_index), '[]'::jsonb)
                          FROM workflow_step_tasks t
                          WHERE t.run_id = $1 AND t.step_slug = $2)
               END
        FROM workflow_step_states s
        JOIN workflow_steps d
          ON d.workflow_slug = s.workflow_slug AND d.step_slug = s.step_slug
        WHERE s.run_id = $1 AND s.step_slug = $2
        "#,
    )
    .bind(run_id)
    .bind(step_slug)
    .fetch_one(conn)
    .await?;

    Ok(output.unwrap_or(Value::Null))
}

/// Mark a step completed and ripple the effects: children lose a dependency,
/// the run loses a step, and a run with no steps left gets its output (leaf
/// merge) and terminal `completed` state. Returns whether the run completed.
async fn cascade_step_completed(
    conn: &mut PgConnection,
    run_id: Uuid,
    step_slug: &str,
    output: Value,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r#"
        UPDATE workflow_step_states
        SET status = 'completed', completed_at = now(),
            started_at = COALESCE(started_at, now()),
            remaining_tasks = 0, output = $3
        WHERE run_id = $1 AND step_slug = $2 AND status IN ('created', 'started')
        "#,
    )
    .bind(run_id)
    .bind(step_slug)
    .bind(&output)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE workflow_step_states
        SET remaining_deps = remaining_deps - 1
        WHERE run_id = $1 AND remaining_deps > 0
          AND step_slug IN (SELECT step_slug FROM workflow_step_dependencies
                            WHERE run_id = $1 AND depends_on_step = $2)
        "#,
    )
    .bind(run_id)
    .bind(step_slug)
    .execute(&mut *conn)
    .await?;

    let run = sqlx::query(
        r#"
        UPDATE workflow_runs
        SET remaining_steps = remaining_steps - 1
        WHERE run_id = $1 AND remaining_steps > 0
        RETURNING remaining_steps, status, input
        "#,
    )
    .bind(run_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(run) = run else {
        return Ok(false);
    };
    let remaining_steps: i32 = run.get("remaining_steps");
    let status: RunStatus = run.get("status");

    if remaining_steps > 0 || status != RunStatus::Started {
        return Ok(false);
    }

    let input: Value = run.get("input");
    let run_output = compute_run_output(&mut *conn, run_id, &input).await?;

    let completed = sqlx::query(
        r#"
        UPDATE workflow_runs
        SET status = 'completed', output = $2, completed_at = now()
        WHERE run_id = $1 AND status = 'started'
        "#,
    )
    .bind(run_id)
    .bind(&run_output)
    .execute(conn)
    .await?;

    if completed.rows_affected() > 0 {
        info!(%run_id, "Run completed");
        return Ok(true);
    }
    Ok(false)
}

/// Run output is the leaf merge: run input unioned with the outputs of every
/// step that has no outgoing edge, in step declaration order.
async fn compute_run_output(
    conn: &mut PgConnection,
    run_id: Uuid,
    input: &Value,
) -> Result<Value, sqlx::Error> {
    let leaves: Vec<ParentOutput> = sqlx::query_as(
        r#"
        SELECT s.step_slug, s.output
        FROM workflow_step_states s
        JOIN workflow_steps d
          ON d.workflow_slug = s.workflow_slug AND d.step_slug = s.step_slug
        WHERE s.run_id = $1
          AND NOT EXISTS (SELECT 1 FROM workflow_step_dependencies e
                          WHERE e.run_id = s.run_id AND e.depends_on_step = s.step_slug)
        ORDER BY d.step_index
        "#,
    )
    .bind(run_id)
    .fetch_all(conn)
    .await?;

    let contributors = leaves
        .iter()
        .filter_map(|leaf| leaf.output.as_ref().map(|o| (leaf.step_slug.as_str(), o)));

    Ok(sl_core::merge::merge_outputs(input, contributors))
}

// =============================================================================
// fail_task
// =============================================================================

/// Record a failed task attempt. While attempts remain the task is requeued
/// with a fresh message (no backoff at this layer); once exhausted, the task,
/// its step and the run all become `failed`. Idempotent by task status.
#[instrument(skip(pool))]
pub async fn fail_task(
    pool: &DbPool,
    run_id: Uuid,
    step_slug: &str,
    task_index: i32,
    error_message: &str,
) -> Result<FailOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let task = sqlx::query(
        r#"
        SELECT workflow_slug, status, attempts_count, max_attempts, message_id
        FROM workflow_step_tasks
        WHERE run_id = $1 AND step_slug = $2 AND task_index = $3
        FOR UPDATE
        "#,
    )
    .bind(run_id)
    .bind(step_slug)
    .bind(task_index)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(task) = task else {
        tx.rollback().await?;
        return Ok(FailOutcome::NoOp);
    };

    let status: crate::models::TaskStatus = task.get("status");
    if status != crate::models::TaskStatus::Started {
        tx.rollback().await?;
        return Ok(FailOutcome::NoOp);
    }

    let workflow_slug: String = task.get("workflow_slug");
    let attempts_count: i32 = task.get("attempts_count");
    let max_attempts: i32 = task.get("max_attempts");
    let message_id: Option<i64> = task.get("message_id");

    // The claimer's message is spent either way.
    if let Some(msg_id) = message_id {
        sqlx::query("DELETE FROM queue_messages WHERE msg_id = $1")
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
    }

    let outcome = if attempts_count < max_attempts {
        let msg_id = enqueue_in_tx(
            &mut *tx,
            &workflow_slug,
            &TaskMessage {
                run_id,
                step_slug: step_slug.to_string(),
                task_index,
            },
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE workflow_step_tasks
            SET status = 'queued', claimed_by = NULL, claimed_at = NULL,
                message_id = $4, queued_at = now()
            WHERE run_id = $1 AND step_slug = $2 AND task_index = $3
            "#,
        )
        .bind(run_id)
        .bind(step_slug)
        .bind(task_index)
        .bind(msg_id)
        .execute(&mut *tx)
        .await?;

        warn!(%run_id, step_slug, task_index, attempts_count, error_message, "Task requeued");
        FailOutcome::Requeued { attempts_count }
    } else {
        sqlx::query(
            r#"
            UPDATE workflow_step_tasks
            SET status = 'failed', error_message = $4, failed_at = now()
            WHERE run_id = $1 AND step_slug = $2 AND task_index = $3
            "#,
        )
        .bind(run_id)
        .bind(step_slug)
        .bind(task_index)
        .bind(error_message)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE workflow_step_states
            SET status = 'failed', error_message = $3, failed_at = now()
            WHERE run_id = $1 AND step_slug = $2 AND status = 'started'
            "#,
        )
        .bind(run_id)
        .bind(step_slug)
        .bind(error_message)
        .execute(&mut *tx)
        .await?;

        // No further children are scheduled; queued siblings stay put and the
        // run's terminal status is the authoritative signal.
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'failed', error_message = $2, failed_at = now()
            WHERE run_id = $1 AND status = 'started'
            "#,
        )
        .bind(run_id)
        .bind(error_message)
        .execute(&mut *tx)
        .await?;

        warn!(%run_id, step_slug, task_index, error_message, "Task failed permanently; run failed");
        FailOutcome::Failed
    };

    tx.commit().await?;
    Ok(outcome)
}
