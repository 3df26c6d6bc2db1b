//! Warden error types.
//!
//! Every failure on the inspection path is a typed outcome. Nothing in the
//! engine, pool, or store is allowed to panic the caller; the variants below
//! are what a caller can observe instead.
//!
//! | Variant           | Origin          | Recovery                                 |
//! |-------------------|-----------------|------------------------------------------|
//! | `ContentTooLarge` | Engine          | Reject locally, nothing scanned          |
//! | `QueueFull`       | Worker pool     | Backpressure, caller may retry later     |
//! | `WorkerFailure`   | Worker pool     | Worker respawned, task not retried       |
//! | `ExternalQuery`   | Vector store    | Degrades to a cache miss                 |
//! | `Timeout`         | Pipeline        | Converted into an explicit Timeout verdict|

use thiserror::Error;

/// Warden errors.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Content exceeds the configured scan limit.
    #[error("Content too large: {size} bytes exceeds limit of {limit}")]
    ContentTooLarge {
        /// Size of the rejected content in bytes.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Worker pool queue is at capacity.
    #[error("Queue full: {depth} tasks already pending")]
    QueueFull {
        /// Configured maximum queue depth.
        depth: usize,
    },

    /// The worker running the task crashed or was recycled.
    #[error("Worker {worker_id} failed: {reason}")]
    WorkerFailure {
        /// Worker that owned the task.
        worker_id: usize,
        /// Why the worker was considered failed.
        reason: String,
    },

    /// Task was discarded during a forced shutdown.
    #[error("Task {task_id} dropped before completion")]
    TaskDropped {
        /// Dropped task.
        task_id: u64,
    },

    /// Pool no longer accepts work.
    #[error("Worker pool is shut down")]
    PoolShutdown,

    /// Task deadline expired before a result arrived.
    #[error("Task {task_id} timed out after {after_ms}ms")]
    Timeout {
        /// Expired task.
        task_id: u64,
        /// Deadline budget in milliseconds.
        after_ms: u64,
    },

    /// External similarity search failed.
    #[error("External query error: {0}")]
    ExternalQuery(String),

    /// Similarity query parameters failed validation.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A pattern rule could not be compiled.
    #[error("Invalid rule '{id}': {reason}")]
    InvalidRule {
        /// Rule identifier.
        id: String,
        /// Compilation failure.
        reason: String,
    },

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// True for errors that signal load rather than a bad request.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, WardenError::QueueFull { .. } | WardenError::PoolShutdown)
    }

    /// True when resubmitting the same request could succeed.
    ///
    /// `WorkerFailure` is deliberately excluded: the input may be what broke
    /// the worker, so retrying is the caller's explicit decision.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WardenError::QueueFull { .. } | WardenError::Timeout { .. } | WardenError::TaskDropped { .. }
        )
    }
}

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

impl From<toml::de::Error> for WardenError {
    fn from(err: toml::de::Error) -> Self {
        WardenError::Config(err.to_string())
    }
}
