//! Workflow definition entity models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Step kind enum matching database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "step_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Single,
    Map,
}

/// Workflow definition entity
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_slug: String,
    pub max_attempts: i32,
    pub timeout_seconds: i32,
    pub created_at: DateTime<Utc>,
}

/// Create workflow request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkflow {
    pub workflow_slug: String,
    pub max_attempts: i32,
    pub timeout_seconds: i32,
}

/// Workflow step definition entity
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub workflow_slug: String,
    pub step_slug: String,
    pub step_index: i32,
    pub step_type: StepKind,
    pub deps_count: i32,
    /// `None` for map steps whose fan-out is sized from the parent output.
    pub initial_tasks: Option<i32>,
    pub max_attempts: i32,
    pub timeout_seconds: i32,
    pub created_at: DateTime<Utc>,
}

/// Create workflow step request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkflowStep {
    pub workflow_slug: String,
    pub step_slug: String,
    pub step_index: i32,
    pub step_type: StepKind,
    pub deps_count: i32,
    pub initial_tasks: Option<i32>,
    pub max_attempts: i32,
    pub timeout_seconds: i32,
}

/// Definition-level dependency edge `dep_slug -> step_slug`
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StepDependencyDef {
    pub workflow_slug: String,
    pub dep_slug: String,
    pub step_slug: String,
    pub created_at: DateTime<Utc>,
}
