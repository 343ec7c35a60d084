//! Error types for Sluice

/// Result type alias using the Sluice Error
pub type Result<T> = std::result::Result<T, Error>;

/// Sluice error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ==========================================================================
    // Caller errors
    // ==========================================================================
    #[error("not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    // ==========================================================================
    // Run outcomes
    // ==========================================================================
    #[error("run failed: {message}")]
    RunFailed { message: String },

    #[error("deadline elapsed while the run is still live")]
    Timeout,

    #[error("batch failure: {failed} of {total} scheduler calls failed")]
    BatchFailure { failed: usize, total: usize },

    // ==========================================================================
    // Backend errors
    // ==========================================================================
    #[error("database error: {0}")]
    Database(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Error code for logs and reports
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NOT_FOUND",
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::RunFailed { .. } => "RUN_FAILED",
            Error::Timeout => "TIMEOUT",
            Error::BatchFailure { .. } => "BATCH_FAILURE",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Queue(_) => "QUEUE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether this error is a transient backend fault the caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Queue(_) | Error::BatchFailure { .. }
        )
    }

    /// Whether this error is a terminal run state rather than an infrastructure fault
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::RunFailed { .. })
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn run_failed(message: impl Into<String>) -> Self {
        Error::RunFailed {
            message: message.into(),
        }
    }
}

/// Validation error builder
pub struct ValidationError {
    message: String,
    field: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn build(self) -> Error {
        Error::Validation {
            message: self.message,
            field: self.field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Database("connection reset".into()).is_retryable());
        assert!(Error::Queue("poll interrupted".into()).is_retryable());
        assert!(!Error::run_failed("boom").is_retryable());
        assert!(!Error::Timeout.is_retryable());
        assert!(!Error::validation("bad slug").is_retryable());
    }

    #[test]
    fn builder_attaches_field() {
        let err = ValidationError::new("must match slug rules")
            .field("step_slug")
            .build();
        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("step_slug")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
