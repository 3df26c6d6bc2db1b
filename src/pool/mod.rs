//! Worker pool: parallel detection with failure isolation.
//!
//! # Architecture
//!
//! ```text
//!   submit() ──try_send──> [bounded MPMC queue] ──> worker 0 (thread, own engine)
//!      ^                                        ├──> worker 1
//!      │                                        └──> worker N-1
//!      │                                                 │
//!      └──────────── per-task oneshot reply <────────────┘
//!
//!   supervisor (tokio task): exit events + heartbeat tick
//!       ├── exited worker        -> respawn
//!       ├── busy > max duration  -> retire, fail task (WorkerFailure), respawn
//!       └── missed heartbeats    -> retire, respawn
//! ```
//!
//! Enqueueing never blocks: a full queue is `QueueFull`. Every submitted task
//! resolves to a result, a `WorkerFailure`, a `Timeout`, or `TaskDropped`.
//! A failed task is never retried.
//!
//! A recycled worker whose engine is truly stuck keeps its OS thread until the
//! engine call returns; its result is discarded.

mod task;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

pub use task::{TaskId, WorkerResult, WorkerTask};
pub use worker::{WorkerHealth, WorkerState};

use task::Envelope;
use worker::{WorkerContext, WorkerExited, WorkerSlot};

use crate::config::PoolConfig;
use crate::detection::{DetectionEngine, DetectionVerdict, Inspect};
use crate::error::{Result, WardenError};
use crate::request::Request;

/// Missed heartbeats before an idle worker is considered dead
const MISSED_HEARTBEATS: u32 = 10;

/// Poll interval while draining
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Builds one inspector per worker (called again on every respawn)
pub type InspectorFactory = Arc<dyn Fn(usize) -> Box<dyn Inspect> + Send + Sync>;

/// What happened to outstanding work during shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Tasks completed while draining
    pub drained: u64,
    /// In-flight tasks failed with `WorkerFailure` after the drain timeout
    pub abandoned_in_flight: usize,
    /// Queued tasks never started, reported as `TaskDropped`
    pub dropped_queued: usize,
}

struct PoolInner {
    config: PoolConfig,
    sender: Mutex<Option<Sender<Envelope>>>,
    receiver: Receiver<Envelope>,
    slots: Mutex<Vec<Arc<WorkerSlot>>>,
    factory: InspectorFactory,
    events: mpsc::UnboundedSender<WorkerExited>,
    abort: Arc<AtomicBool>,
    shutting_down: AtomicBool,
    total_completed: Arc<AtomicU64>,
    respawns: AtomicU64,
    recycles: AtomicU64,
    stop: watch::Sender<bool>,
}

/// Fixed-size pool of detection workers
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.inner.config.workers)
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

impl WorkerPool {
    /// Start the pool; must be called from within a tokio runtime
    pub fn new(config: PoolConfig, factory: InspectorFactory) -> Result<Self> {
        if config.workers == 0 || config.max_queue_depth == 0 {
            return Err(WardenError::Config(
                "pool needs at least one worker and a queue depth above zero".to_string(),
            ));
        }

        let (sender, receiver) = channel::bounded(config.max_queue_depth);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);

        let inner = Arc::new(PoolInner {
            sender: Mutex::new(Some(sender)),
            receiver,
            slots: Mutex::new(Vec::with_capacity(config.workers)),
            factory,
            events,
            abort: Arc::new(AtomicBool::new(false)),
            shutting_down: AtomicBool::new(false),
            total_completed: Arc::new(AtomicU64::new(0)),
            respawns: AtomicU64::new(0),
            recycles: AtomicU64::new(0),
            stop,
            config,
        });

        {
            let mut slots = inner.slots();
            for worker_id in 0..inner.config.workers {
                slots.push(inner.start_worker(worker_id, 1)?);
            }
        }

        tokio::spawn(supervise(Arc::downgrade(&inner), events_rx, stop_rx));

        tracing::info!(
            workers = inner.config.workers,
            queue_depth = inner.config.max_queue_depth,
            "worker pool started"
        );
        Ok(Self { inner })
    }

    /// One clone of `engine` per worker
    pub fn with_engine(config: PoolConfig, engine: DetectionEngine) -> Result<Self> {
        let factory: InspectorFactory = Arc::new(move |_: usize| Box::new(engine.clone()) as Box<dyn Inspect>);
        Self::new(config, factory)
    }

    /// Enqueue a task and wait for its result or its deadline.
    ///
    /// Fails fast with `QueueFull` when the queue is at capacity.
    pub async fn submit(&self, task: WorkerTask) -> Result<WorkerResult> {
        let task_id = task.task_id;
        let deadline = task.deadline;
        let submitted = Instant::now();
        let rx = self.enqueue(task)?;

        match tokio::time::timeout_at(deadline.into(), rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(WardenError::TaskDropped { task_id: task_id.0 }),
            Err(_) => {
                tracing::debug!(task_id = %task_id, "task deadline expired, result will be discarded");
                Err(WardenError::Timeout {
                    task_id: task_id.0,
                    after_ms: submitted.elapsed().as_millis() as u64,
                })
            },
        }
    }

    /// Submit a request and flatten the worker's outcome
    pub async fn inspect(&self, request: Request, deadline: Instant) -> Result<DetectionVerdict> {
        self.submit(WorkerTask::new(request, deadline)).await?.outcome
    }

    fn enqueue(&self, task: WorkerTask) -> Result<oneshot::Receiver<WorkerResult>> {
        let (reply, rx) = oneshot::channel();
        let guard = self.inner.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(WardenError::PoolShutdown)?;

        match sender.try_send(Envelope { task, reply }) {
            Ok(()) => Ok(rx),
            Err(TrySendError::Full(_)) => Err(WardenError::QueueFull {
                depth: self.inner.config.max_queue_depth,
            }),
            Err(TrySendError::Disconnected(_)) => Err(WardenError::PoolShutdown),
        }
    }

    /// Tasks waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Configured worker count
    pub fn workers(&self) -> usize {
        self.inner.config.workers
    }

    /// Per-worker health
    pub fn health(&self) -> Vec<WorkerHealth> {
        self.inner.slots().iter().map(|s| s.health()).collect()
    }

    /// Workers replaced so far (crashes, recycles, missed heartbeats)
    pub fn respawns(&self) -> u64 {
        self.inner.respawns.load(Ordering::Relaxed)
    }

    /// Workers recycled for exceeding the max task duration
    pub fn recycles(&self) -> u64 {
        self.inner.recycles.load(Ordering::Relaxed)
    }

    /// True once `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Stop intake, drain for up to `drain`, then fail what is left.
    ///
    /// Calling it again returns an empty report.
    pub async fn shutdown(&self, drain: Duration) -> ShutdownReport {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }

        let completed_before = inner.total_completed.load(Ordering::Relaxed);
        let _ = inner.stop.send(true);
        // closing the sender lets idle workers exit once the queue is empty
        drop(inner.sender.lock().unwrap_or_else(PoisonError::into_inner).take());

        let deadline = Instant::now() + drain;
        while !inner.is_idle() && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        inner.abort.store(true, Ordering::Release);

        let mut dropped_queued = 0;
        while let Ok(envelope) = inner.receiver.try_recv() {
            tracing::debug!(task_id = %envelope.task.task_id, "dropping queued task");
            // dropping the reply sender resolves the caller with TaskDropped
            drop(envelope);
            dropped_queued += 1;
        }

        let abandoned_in_flight = inner
            .slots()
            .iter()
            .filter(|slot| slot.fail_in_flight("pool shut down before the task finished"))
            .count();

        let report = ShutdownReport {
            drained: inner.total_completed.load(Ordering::Relaxed) - completed_before,
            abandoned_in_flight,
            dropped_queued,
        };
        tracing::info!(
            drained = report.drained,
            abandoned = report.abandoned_in_flight,
            dropped = report.dropped_queued,
            "worker pool shut down"
        );
        report
    }
}

impl PoolInner {
    fn slots(&self) -> MutexGuard<'_, Vec<Arc<WorkerSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_idle(&self) -> bool {
        self.receiver.is_empty() && !self.slots().iter().any(|s| s.is_busy())
    }

    fn start_worker(&self, worker_id: usize, generation: u64) -> Result<Arc<WorkerSlot>> {
        let slot = Arc::new(WorkerSlot::new(worker_id, generation));
        let ctx = WorkerContext {
            slot: Arc::clone(&slot),
            queue: self.receiver.clone(),
            inspector: (self.factory)(worker_id),
            events: self.events.clone(),
            heartbeat: self.config.heartbeat_interval(),
            abort: Arc::clone(&self.abort),
            total_completed: Arc::clone(&self.total_completed),
        };
        worker::spawn(ctx)?;
        Ok(slot)
    }

    /// Replace exited, hung, and silent workers
    fn check_workers(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let max_task = self.config.max_task_duration();
        let silent_after = self.config.heartbeat_interval() * MISSED_HEARTBEATS;
        let mut slots = self.slots();

        for idx in 0..slots.len() {
            let slot = Arc::clone(&slots[idx]);

            let reason = if slot.has_exited() {
                Some("exited")
            } else if slot.is_retired() {
                // an earlier replacement attempt failed
                Some("retired")
            } else if slot.busy_for().is_some_and(|d| d > max_task) {
                slot.retire();
                if slot.fail_in_flight(&format!("exceeded max task duration of {}ms", max_task.as_millis())) {
                    self.recycles.fetch_add(1, Ordering::Relaxed);
                }
                Some("exceeded max task duration")
            } else if !slot.is_busy() && slot.heartbeat_age() > silent_after {
                slot.retire();
                Some("missed heartbeats")
            } else {
                None
            };

            let Some(reason) = reason else { continue };

            match self.start_worker(slot.worker_id, slot.generation + 1) {
                Ok(replacement) => {
                    tracing::warn!(
                        worker_id = slot.worker_id,
                        generation = replacement.generation,
                        reason,
                        "worker replaced"
                    );
                    slots[idx] = replacement;
                    self.respawns.fetch_add(1, Ordering::Relaxed);
                },
                Err(e) => {
                    slot.retire();
                    tracing::error!(worker_id = slot.worker_id, "failed to respawn worker: {e}");
                },
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Release);
    }
}

async fn supervise(
    inner: Weak<PoolInner>,
    mut events: mpsc::UnboundedReceiver<WorkerExited>,
    mut stop: watch::Receiver<bool>,
) {
    let interval = match inner.upgrade() {
        Some(inner) => inner.config.heartbeat_interval(),
        None => return,
    };
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(exit) = events.recv() => {
                if exit.panicked {
                    tracing::warn!(worker_id = exit.worker_id, generation = exit.generation, "worker crashed");
                } else {
                    tracing::debug!(worker_id = exit.worker_id, generation = exit.generation, "worker exited");
                }
            }
            _ = tick.tick() => {}
            _ = stop.changed() => break,
        }

        match inner.upgrade() {
            Some(inner) => inner.check_workers(),
            None => break,
        }
    }

    tracing::debug!("pool supervisor stopped");
}
