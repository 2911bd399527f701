use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored or supplied recurrence rule is unusable.
    #[error("Invalid recurrence: {0}")]
    InvalidRecurrence(String),

    /// No task with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: i64 },

    /// A task store other than SQLite failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration handed to the engine is invalid.
    #[error(transparent)]
    Config(#[from] duebell_core::DuebellError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure reported by a [`Notifier`](crate::notify::Notifier).
///
/// Never propagated past the delivery task: the engine logs it and moves on.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by receiver with status {status}")]
    Rejected { status: u16 },

    #[error("delivery channel closed")]
    Closed,
}
