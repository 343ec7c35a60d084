//! Step-task entity models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Task status enum matching database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Step task entity: one invocation unit of a user step function
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StepTask {
    pub run_id: Uuid,
    pub workflow_slug: String,
    pub step_slug: String,
    pub task_index: i32,
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempts_count: i32,
    pub max_attempts: i32,
    pub message_id: Option<i64>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// A task successfully claimed by `start_tasks`, ready for execution.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub run_id: Uuid,
    pub step_slug: String,
    pub task_index: i32,
    pub input: serde_json::Value,
}
