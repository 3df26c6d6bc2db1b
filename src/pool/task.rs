//! Units of work exchanged with pool workers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::detection::DetectionVerdict;
use crate::error::Result;
use crate::request::Request;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique task id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Allocate the next id
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One request dispatched to the pool
#[derive(Debug, Clone)]
pub struct WorkerTask {
    /// Task id
    pub task_id: TaskId,
    /// Input
    pub request: Request,
    /// Result is useless after this instant
    pub deadline: Instant,
}

impl WorkerTask {
    /// New task with a fresh id
    pub fn new(request: Request, deadline: Instant) -> Self {
        Self {
            task_id: TaskId::next(),
            request,
            deadline,
        }
    }

    /// True once the deadline has passed
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Outcome of one task
#[derive(Debug)]
pub struct WorkerResult {
    /// Task id
    pub task_id: TaskId,
    /// Verdict or error
    pub outcome: Result<DetectionVerdict>,
    /// Worker that produced it
    pub worker_id: usize,
    /// Time spent inside the worker
    pub duration_ns: u64,
}

/// Task plus its private reply channel
pub(crate) struct Envelope {
    pub task: WorkerTask,
    pub reply: oneshot::Sender<WorkerResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_task_ids_unique() {
        let a = WorkerTask::new(Request::text("a"), Instant::now());
        let b = WorkerTask::new(Request::text("b"), Instant::now());
        assert_ne!(a.task_id, b.task_id);
        assert!(b.task_id > a.task_id);
    }

    #[test]
    fn test_expiry() {
        let past = WorkerTask::new(Request::text("x"), Instant::now());
        assert!(past.is_expired());
        let future = WorkerTask::new(Request::text("x"), Instant::now() + Duration::from_secs(60));
        assert!(!future.is_expired());
    }
}
