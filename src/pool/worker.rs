//! Worker threads.
//!
//! Each worker is a dedicated OS thread that owns one [`Inspect`] instance and
//! pulls envelopes from the shared bounded queue. The only state shared with
//! the supervisor is the worker's [`WorkerSlot`]: heartbeat, the task in
//! flight (with its reply channel), and the retired flag.
//!
//! Whoever takes the in-flight reply first answers the caller. Normally that
//! is the worker itself; if the supervisor recycles a hung worker it takes the
//! reply and answers with `WorkerFailure`, and the late result is discarded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::task::{Envelope, TaskId, WorkerResult};
use crate::detection::{elapsed_ns, Inspect};
use crate::error::WardenError;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for work
    Idle,
    /// Running a task
    Busy,
    /// Marked for replacement, thread may still be running
    Retired,
    /// Thread has exited
    Exited,
}

/// Health snapshot of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Worker index
    pub worker_id: usize,
    /// Incremented on every respawn of this index
    pub generation: u64,
    /// Current state
    pub state: WorkerState,
    /// Time since the last heartbeat
    pub heartbeat_age_ms: u64,
    /// Time spent on the current task
    pub busy_for_ms: Option<u64>,
    /// Tasks completed by this generation
    pub tasks_completed: u64,
}

/// Notification from a worker thread to the supervisor
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerExited {
    pub worker_id: usize,
    pub generation: u64,
    pub panicked: bool,
}

pub(crate) struct InFlight {
    pub task_id: TaskId,
    pub reply: oneshot::Sender<WorkerResult>,
    pub started: Instant,
}

/// State shared between one worker thread and the supervisor
pub(crate) struct WorkerSlot {
    pub worker_id: usize,
    pub generation: u64,
    retired: AtomicBool,
    exited: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    in_flight: Mutex<Option<InFlight>>,
    completed: AtomicU64,
}

impl WorkerSlot {
    pub fn new(worker_id: usize, generation: u64) -> Self {
        Self {
            worker_id,
            generation,
            retired: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
            in_flight: Mutex::new(None),
            completed: AtomicU64::new(0),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn beat(&self) {
        *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// How long the current task has been running
    pub fn busy_for(&self) -> Option<Duration> {
        self.in_flight().as_ref().map(|f| f.started.elapsed())
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight().is_some()
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Take the in-flight reply, if the worker has not answered yet
    pub fn take_in_flight(&self) -> Option<InFlight> {
        self.in_flight().take()
    }

    /// Answer the in-flight task (if still pending) with a failure
    pub fn fail_in_flight(&self, reason: &str) -> bool {
        match self.take_in_flight() {
            Some(flight) => {
                let result = WorkerResult {
                    task_id: flight.task_id,
                    outcome: Err(WardenError::WorkerFailure {
                        worker_id: self.worker_id,
                        reason: reason.to_string(),
                    }),
                    worker_id: self.worker_id,
                    duration_ns: elapsed_ns(flight.started),
                };
                let _ = flight.reply.send(result);
                true
            },
            None => false,
        }
    }

    pub fn health(&self) -> WorkerHealth {
        let busy_for = self.busy_for();
        let state = if self.has_exited() {
            WorkerState::Exited
        } else if self.is_retired() {
            WorkerState::Retired
        } else if busy_for.is_some() {
            WorkerState::Busy
        } else {
            WorkerState::Idle
        };
        WorkerHealth {
            worker_id: self.worker_id,
            generation: self.generation,
            state,
            heartbeat_age_ms: self.heartbeat_age().as_millis() as u64,
            busy_for_ms: busy_for.map(|d| d.as_millis() as u64),
            tasks_completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Everything a worker thread needs
pub(crate) struct WorkerContext {
    pub slot: Arc<WorkerSlot>,
    pub queue: Receiver<Envelope>,
    pub inspector: Box<dyn Inspect>,
    pub events: mpsc::UnboundedSender<WorkerExited>,
    pub heartbeat: Duration,
    pub abort: Arc<AtomicBool>,
    pub total_completed: Arc<AtomicU64>,
}

/// Reports the exit (clean or panic) and fails whatever was in flight.
struct ExitGuard {
    slot: Arc<WorkerSlot>,
    events: mpsc::UnboundedSender<WorkerExited>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let panicked = std::thread::panicking();
        if panicked {
            self.slot.fail_in_flight("worker panicked");
            tracing::warn!(
                worker_id = self.slot.worker_id,
                generation = self.slot.generation,
                "worker panicked"
            );
        } else {
            self.slot.fail_in_flight("worker exited");
        }
        self.slot.exited.store(true, Ordering::Release);
        let _ = self.events.send(WorkerExited {
            worker_id: self.slot.worker_id,
            generation: self.slot.generation,
            panicked,
        });
    }
}

/// Start a worker thread
pub(crate) fn spawn(ctx: WorkerContext) -> std::io::Result<JoinHandle<()>> {
    let name = format!("warden-worker-{}", ctx.slot.worker_id);
    std::thread::Builder::new().name(name).spawn(move || run(ctx))
}

fn run(mut ctx: WorkerContext) {
    let _guard = ExitGuard {
        slot: Arc::clone(&ctx.slot),
        events: ctx.events.clone(),
    };

    tracing::debug!(
        worker_id = ctx.slot.worker_id,
        generation = ctx.slot.generation,
        "worker started"
    );

    loop {
        ctx.slot.beat();
        if ctx.slot.is_retired() || ctx.abort.load(Ordering::Acquire) {
            break;
        }

        match ctx.queue.recv_timeout(ctx.heartbeat) {
            Ok(envelope) => process(&mut ctx, envelope),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::debug!(worker_id = ctx.slot.worker_id, "worker stopped");
}

fn process(ctx: &mut WorkerContext, envelope: Envelope) {
    let Envelope { task, reply } = envelope;
    let worker_id = ctx.slot.worker_id;

    if reply.is_closed() {
        tracing::debug!(worker_id, task_id = %task.task_id, "caller gone, skipping task");
        return;
    }

    if task.is_expired() {
        let _ = reply.send(WorkerResult {
            task_id: task.task_id,
            outcome: Err(WardenError::Timeout {
                task_id: task.task_id.0,
                after_ms: task.request.received_at().elapsed().as_millis() as u64,
            }),
            worker_id,
            duration_ns: 0,
        });
        return;
    }

    let started = Instant::now();
    *ctx.slot.in_flight() = Some(InFlight {
        task_id: task.task_id,
        reply,
        started,
    });

    let outcome = ctx.inspector.inspect(&task.request);
    let duration_ns = elapsed_ns(started);
    ctx.slot.beat();

    match ctx.slot.take_in_flight() {
        Some(flight) => {
            let _ = flight.reply.send(WorkerResult {
                task_id: task.task_id,
                outcome,
                worker_id,
                duration_ns,
            });
            ctx.slot.completed.fetch_add(1, Ordering::Relaxed);
            ctx.total_completed.fetch_add(1, Ordering::Relaxed);
        },
        None => {
            tracing::debug!(worker_id, task_id = %task.task_id, "late result discarded");
        },
    }
}
