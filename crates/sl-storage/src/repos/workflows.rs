//! Workflows repository

use crate::models::{CreateWorkflow, CreateWorkflowStep, Workflow, WorkflowStep};
use crate::DbPool;
use sqlx::PgConnection;
use tracing::instrument;

/// Repository for workflow definition rows
#[derive(Clone)]
pub struct WorkflowsRepo {
    pool: DbPool,
}

impl WorkflowsRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a workflow by slug
    #[instrument(skip(self))]
    pub async fn get(&self, workflow_slug: &str) -> Result<Option<Workflow>, sqlx::Error> {
        sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE workflow_slug = $1")
            .bind(workflow_slug)
            .fetch_optional(&self.pool)
            .await
    }

    /// List step definitions for a workflow, in index order
    #[instrument(skip(self))]
    pub async fn list_steps(&self, workflow_slug: &str) -> Result<Vec<WorkflowStep>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowStep>(
            r#"
            SELECT * FROM workflow_steps
            WHERE workflow_slug = $1
            ORDER BY step_index ASC
            "#,
        )
        .bind(workflow_slug)
        .fetch_all(&self.pool)
        .await
    }

    /// Insert definition rows for a code-defined workflow if they are not
    /// present yet. Definitions are treated as immutable once written, so
    /// conflicts are left untouched.
    pub async fn ensure_definition_in_tx(
        conn: &mut PgConnection,
        workflow: &CreateWorkflow,
        steps: &[CreateWorkflowStep],
        dependencies: &[(String, String)],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO workflows (workflow_slug, max_attempts, timeout_seconds)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_slug) DO NOTHING
            "#,
        )
        .bind(&workflow.workflow_slug)
        .bind(workflow.max_attempts)
        .bind(workflow.timeout_seconds)
        .execute(&mut *conn)
        .await?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO workflow_steps
                    (workflow_slug, step_slug, step_index, step_type, deps_count,
                     initial_tasks, max_attempts, timeout_seconds)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (workflow_slug, step_slug) DO NOTHING
                "#,
            )
            .bind(&step.workflow_slug)
            .bind(&step.step_slug)
            .bind(step.step_index)
            .bind(step.step_type)
            .bind(step.deps_count)
            .bind(step.initial_tasks)
            .bind(step.max_attempts)
            .bind(step.timeout_seconds)
            .execute(&mut *conn)
            .await?;
        }

        for (dep_slug, step_slug) in dependencies {
            sqlx::query(
                r#"
                INSERT INTO workflow_step_dependencies_def (workflow_slug, dep_slug, step_slug)
                VALUES ($1, $2, $3)
                ON CONFLICT (workflow_slug, dep_slug, step_slug) DO NOTHING
                "#,
            )
            .bind(&workflow.workflow_slug)
            .bind(dep_slug)
            .bind(step_slug)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }
}
