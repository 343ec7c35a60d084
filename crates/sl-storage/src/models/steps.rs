//! Step-state entity models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Step status enum matching database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "step_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Created,
    Started,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Created => write!(f, "created"),
            StepStatus::Started => write!(f, "started"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-run step state entity
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StepState {
    pub run_id: Uuid,
    pub workflow_slug: String,
    pub step_slug: String,
    pub status: StepStatus,
    pub remaining_deps: i32,
    pub initial_tasks: Option<i32>,
    pub remaining_tasks: i32,
    pub attempts_count: i32,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Create step-state request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStepState {
    pub run_id: Uuid,
    pub workflow_slug: String,
    pub step_slug: String,
    pub remaining_deps: i32,
    pub initial_tasks: Option<i32>,
}

/// Per-run dependency edge `depends_on_step -> step_slug`
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StepDependency {
    pub run_id: Uuid,
    pub step_slug: String,
    pub depends_on_step: String,
}
