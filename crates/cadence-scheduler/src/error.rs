use cadence_core::CoreError;
use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur within the scheduler subsystem.
///
/// Handler failures are not represented here: they become a `JobResult` and are
/// recovered inside the execution engine. Everything below is either a caller
/// mistake, a configuration gap, or an infrastructure failure.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed input at construction time (bad ids, negative retry budgets, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The recurrence policy cannot produce a next run time.
    #[error("Invalid recurrence: {0}")]
    InvalidRecurrence(String),

    /// An operation was attempted on a job whose status does not permit it.
    #[error("Job {id} is {status}; cannot {action}")]
    InvalidState {
        id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Illegal status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// No registered handler claims the job type.
    #[error("No handler found for job type {job_type:?}")]
    NoHandlerFound { job_type: String },

    /// A conditional write lost the race: the stored record changed since the caller read it.
    #[error("Conflicting write for job {id} (occurrence {occurrence}): stored status is {stored}")]
    Conflict {
        id: String,
        occurrence: u32,
        stored: JobStatus,
    },

    /// A stored row could not be decoded back into a job.
    #[error("Corrupt job record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The dispatch transport refused the message.
    #[error("Queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SchedulerError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidArgument(_) => "INVALID_ARGUMENT",
            SchedulerError::InvalidRecurrence(_) => "INVALID_RECURRENCE",
            SchedulerError::InvalidState { .. } => "INVALID_STATE",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::NoHandlerFound { .. } => "NO_HANDLER_FOUND",
            SchedulerError::Conflict { .. } => "CONFLICT",
            SchedulerError::CorruptRecord { .. } => "CORRUPT_RECORD",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Queue(_) => "QUEUE_ERROR",
            SchedulerError::Core(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
