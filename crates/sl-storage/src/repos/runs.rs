//! Runs repository

use crate::models::{CreateRun, CreateStepState, Run, RunStepCounts, StepState, StepTask};
use crate::DbPool;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Repository for run, step-state and task rows
#[derive(Clone)]
pub struct RunsRepo {
    pool: DbPool,
}

impl RunsRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a run by id
    #[instrument(skip(self))]
    pub async fn get(&self, run_id: Uuid) -> Result<Option<Run>, sqlx::Error> {
        sqlx::query_as::<_, Run>("SELECT * FROM workflow_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// List step states for a run, in step-index order
    #[instrument(skip(self))]
    pub async fn list_step_states(&self, run_id: Uuid) -> Result<Vec<StepState>, sqlx::Error> {
        sqlx::query_as::<_, StepState>(
            r#"
            SELECT s.* FROM workflow_step_states s
            JOIN workflow_steps d
              ON d.workflow_slug = s.workflow_slug AND d.step_slug = s.step_slug
            WHERE s.run_id = $1
            ORDER BY d.step_index ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Get one task row
    #[instrument(skip(self))]
    pub async fn get_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: i32,
    ) -> Result<Option<StepTask>, sqlx::Error> {
        sqlx::query_as::<_, StepTask>(
            r#"
            SELECT * FROM workflow_step_tasks
            WHERE run_id = $1 AND step_slug = $2 AND task_index = $3
            "#,
        )
        .bind(run_id)
        .bind(step_slug)
        .bind(task_index)
        .fetch_optional(&self.pool)
        .await
    }

    /// List all tasks of one step, in task-index order
    #[instrument(skip(self))]
    pub async fn list_tasks(
        &self,
        run_id: Uuid,
        step_slug: &str,
    ) -> Result<Vec<StepTask>, sqlx::Error> {
        sqlx::query_as::<_, StepTask>(
            r#"
            SELECT * FROM workflow_step_tasks
            WHERE run_id = $1 AND step_slug = $2
            ORDER BY task_index ASC
            "#,
        )
        .bind(run_id)
        .bind(step_slug)
        .fetch_all(&self.pool)
        .await
    }

    /// Aggregate step counters for the metrics surface. Missing runs yield
    /// zeros rather than an error.
    #[instrument(skip(self))]
    pub async fn step_counts(&self, run_id: Uuid) -> Result<RunStepCounts, sqlx::Error> {
        sqlx::query_as::<_, RunStepCounts>(
            r#"
            SELECT
                COUNT(*) AS total_steps,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed_steps,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_steps
            FROM workflow_step_states
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
    }

    /// Insert the run row inside an open initialization transaction.
    pub async fn create_in_tx(conn: &mut PgConnection, run: &CreateRun) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (run_id, workflow_slug, input, remaining_steps, started_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.workflow_slug)
        .bind(&run.input)
        .bind(run.remaining_steps)
        .bind(run.started_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Insert one step-state row inside an open initialization transaction.
    pub async fn create_step_state_in_tx(
        conn: &mut PgConnection,
        state: &CreateStepState,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO workflow_step_states
                (run_id, workflow_slug, step_slug, remaining_deps, initial_tasks)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(state.run_id)
        .bind(&state.workflow_slug)
        .bind(&state.step_slug)
        .bind(state.remaining_deps)
        .bind(state.initial_tasks)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Insert one per-run dependency edge inside an open initialization
    /// transaction.
    pub async fn create_dependency_in_tx(
        conn: &mut PgConnection,
        run_id: Uuid,
        step_slug: &str,
        depends_on_step: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO workflow_step_dependencies (run_id, step_slug, depends_on_step)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(run_id)
        .bind(step_slug)
        .bind(depends_on_step)
        .execute(conn)
        .await?;
        Ok(())
    }
}
