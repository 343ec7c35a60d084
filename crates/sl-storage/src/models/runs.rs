//! Run entity models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Run status enum matching database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Started => write!(f, "started"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Run entity
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub workflow_slug: String,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub remaining_steps: i32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Create run request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRun {
    pub run_id: Uuid,
    pub workflow_slug: String,
    pub input: serde_json::Value,
    pub remaining_steps: i32,
    pub started_at: DateTime<Utc>,
}

/// Aggregated step counters for one run, feeding the metrics surface.
#[derive(Debug, Clone, Default, FromRow, Serialize)]
pub struct RunStepCounts {
    pub total_steps: i64,
    pub completed_steps: i64,
    pub failed_steps: i64,
}
