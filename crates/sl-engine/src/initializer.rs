//! Run initializer
//!
//! Persists a new run in a single transaction: the run row, one step state
//! per step, the per-run dependency edges, the workflow definition rows for
//! code-defined flows, the workflow's queue, and the initial
//! `start_ready_steps` that enqueues the root tasks. Any failure rolls the
//! whole initialization back.

use crate::db_err;
use sl_core::{Clock, Error, IdGen, Result};
use sl_dag::{Flow, StepKind};
use sl_storage::models::{CreateRun, CreateStepState, CreateWorkflow, CreateWorkflowStep};
use sl_storage::models::StepKind as DbStepKind;
use sl_storage::{queue, scheduler, DbPool, RunsRepo, WorkflowsRepo};
use tracing::{info, instrument};
use uuid::Uuid;

fn to_db_kind(kind: StepKind) -> DbStepKind {
    match kind {
        StepKind::Single => DbStepKind::Single,
        StepKind::Map => DbStepKind::Map,
    }
}

/// Create and kick off a run of `flow` with `input`. Returns the run id.
#[instrument(skip_all, fields(workflow_slug = %flow.slug()))]
pub async fn start_run(
    pool: &DbPool,
    flow: &Flow,
    input: serde_json::Value,
    clock: &dyn Clock,
    ids: &dyn IdGen,
) -> Result<Uuid> {
    if flow.is_empty() {
        return Err(Error::validation("workflow has no steps"));
    }

    let run_id = ids.next_id();
    let mut tx = pool.begin().await.map_err(db_err)?;

    let workflow = CreateWorkflow {
        workflow_slug: flow.slug().to_string(),
        max_attempts: flow.default_max_attempts(),
        timeout_seconds: flow.default_timeout_seconds(),
    };

    let mut steps = Vec::with_capacity(flow.len());
    let mut dependencies = Vec::new();
    for (index, step) in flow.steps().iter().enumerate() {
        let meta = flow
            .meta(&step.slug)
            .map_err(|e| Error::validation(e.to_string()))?;
        steps.push(CreateWorkflowStep {
            workflow_slug: flow.slug().to_string(),
            step_slug: step.slug.clone(),
            step_index: index as i32,
            step_type: to_db_kind(step.kind),
            deps_count: step.depends_on.len() as i32,
            initial_tasks: meta.initial_tasks,
            max_attempts: meta.max_attempts,
            timeout_seconds: meta.timeout_seconds,
        });
        for dep in &step.depends_on {
            dependencies.push((dep.clone(), step.slug.clone()));
        }
    }

    WorkflowsRepo::ensure_definition_in_tx(&mut *tx, &workflow, &steps, &dependencies)
        .await
        .map_err(db_err)?;

    RunsRepo::create_in_tx(
        &mut *tx,
        &CreateRun {
            run_id,
            workflow_slug: flow.slug().to_string(),
            input,
            remaining_steps: flow.len() as i32,
            started_at: clock.now(),
        },
    )
    .await
    .map_err(db_err)?;

    for step in &steps {
        RunsRepo::create_step_state_in_tx(
            &mut *tx,
            &CreateStepState {
                run_id,
                workflow_slug: step.workflow_slug.clone(),
                step_slug: step.step_slug.clone(),
                remaining_deps: step.deps_count,
                initial_tasks: step.initial_tasks,
            },
        )
        .await
        .map_err(db_err)?;
    }

    for (dep_slug, step_slug) in &dependencies {
        RunsRepo::create_dependency_in_tx(&mut *tx, run_id, step_slug, dep_slug)
            .await
            .map_err(db_err)?;
    }

    queue::ensure_in_tx(&mut *tx, flow.slug())
        .await
        .map_err(db_err)?;

    scheduler::start_ready_steps_in_tx(&mut *tx, run_id)
        .await
        .map_err(db_err)?;

    tx.commit().await.map_err(db_err)?;

    info!(%run_id, workflow_slug = %flow.slug(), "Run started");
    Ok(run_id)
}
