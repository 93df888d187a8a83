use thiserror::Error;

/// Persistence failures. Always fatal for the attempt that hit them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored column could not be decoded back into a task field.
    #[error("corrupt row for task {id}: {reason}")]
    CorruptRow { id: String, reason: String },

    /// A second task with the same type or id was inserted.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned by a panicking writer.
    #[error("storage lock poisoned")]
    LockPoisoned,
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Unknown frequency or task type, duplicate registration, bad catalog.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No task with the given ID exists in the store.
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    /// Another execution of the same task has not committed yet.
    #[error("task {id} is already running")]
    AlreadyRunning { id: String },

    /// The caller gave up before the handler started; nothing was recorded.
    #[error("task {id} was cancelled before it started")]
    Cancelled { id: String },

    /// The handler failed. Raised only after the failure was recorded.
    #[error("task {id} failed: {message}")]
    TaskFailed { id: String, message: String },
}

impl SchedulerError {
    /// Short code for operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Configuration(_) => "CONFIGURATION_ERROR",
            SchedulerError::Store(_) => "STORE_ERROR",
            SchedulerError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            SchedulerError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            SchedulerError::Cancelled { .. } => "CANCELLED",
            SchedulerError::TaskFailed { .. } => "TASK_FAILED",
        }
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::Store(StoreError::Database(e))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
