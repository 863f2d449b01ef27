//! Stockpile error types.

use thiserror::Error;

/// Top-level error for all Stockpile crates.
#[derive(Debug, Error)]
pub enum StockpileError {
    /// Configuration problems: unreadable files, bad TOML, unknown
    /// collection types at dispatch time.
    #[error("config error: {0}")]
    Config(String),

    /// Task repository failures (SQLite open, migration, query).
    #[error("database error: {0}")]
    Database(String),

    /// A task could not be found by id.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The requested operation conflicts with the task's current state,
    /// e.g. cancelling or deleting a RUNNING task.
    #[error("task {0} is running")]
    TaskRunning(String),

    /// Immediate dispatch lost the claim race or the task is not due.
    #[error("task {0} is already in progress or not claimable")]
    AlreadyInProgress(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StockpileError>;
