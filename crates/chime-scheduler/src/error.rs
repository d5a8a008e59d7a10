use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Only creation-time validation (`InvalidSchedule`) surfaces to callers
/// synchronously; the dispatch loops log and absorb everything else.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error while opening the store (e.g. the database
    /// directory could not be created).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided schedule definition is invalid (e.g. end before start).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No callback is registered for the task type. The task is dropped
    /// from the catalogue, not retried.
    #[error("No callback registered for task type: {task_type}")]
    UnregisteredType { task_type: String },

    /// No task with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// `start()` was called while dispatch loops are already running.
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// `shutdown()` was called with no dispatch loops running.
    #[error("Scheduler is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
