//! Fault containment for user step code
//!
//! Every task invocation is wrapped here: domain errors, panics and
//! deadline overruns all collapse into a [`TaskOutcome`]. No user fault ever
//! crosses the worker boundary as an `Err`.

use serde_json::Value;
use sl_dag::StepHandler;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Classified result of one task invocation.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The handler returned a value; report through `complete_task`.
    Success(Value),
    /// The handler returned a domain error; report through `fail_task`.
    Failure(String),
    /// The hard deadline elapsed and the activity was killed.
    TimedOut,
    /// The handler panicked; the activity was isolated, peers unaffected.
    Panicked(String),
}

impl TaskOutcome {
    /// The error text recorded by `fail_task` for non-success outcomes.
    pub fn error_text(&self) -> Option<String> {
        match self {
            TaskOutcome::Success(_) => None,
            TaskOutcome::Failure(message) => Some(message.clone()),
            TaskOutcome::TimedOut => Some("timeout".to_string()),
            TaskOutcome::Panicked(detail) => Some(format!("exception: {detail}")),
        }
    }
}

/// Run one task on its own activity with a hard deadline.
///
/// The handler is spawned so a panic aborts only its own activity, and the
/// deadline kills it with prejudice.
#[instrument(skip(handler, input), fields(step_slug = %handler.slug()))]
pub async fn run_contained(
    handler: Arc<dyn StepHandler>,
    input: Value,
    deadline: Duration,
) -> TaskOutcome {
    let mut activity = tokio::spawn(async move { handler.run(input).await });

    match tokio::time::timeout(deadline, &mut activity).await {
        Ok(Ok(Ok(value))) => TaskOutcome::Success(value),
        Ok(Ok(Err(domain_error))) => TaskOutcome::Failure(format!("{domain_error:#}")),
        Ok(Err(join_error)) => {
            if join_error.is_panic() {
                TaskOutcome::Panicked(panic_detail(join_error))
            } else {
                TaskOutcome::Panicked("activity cancelled".to_string())
            }
        }
        Err(_elapsed) => {
            activity.abort();
            TaskOutcome::TimedOut
        }
    }
}

fn panic_detail(join_error: tokio::task::JoinError) -> String {
    match join_error.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "panic with non-string payload".to_string()
            }
        }
        Err(_) => "activity cancelled".to_string(),
    }
}
