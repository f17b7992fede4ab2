//! Dispatcher: owns the worker pool and routes submissions to idle workers.
//!
//! Routing is a two-stage rendezvous. Idle workers publish their inbound slot
//! into the pool-of-slots (a bounded channel of capacity N); the supervisor
//! takes the next job from the submission queue, takes the next slot from the
//! pool, and writes the job straight into that slot. No central bookkeeping of
//! which worker is free is needed: being in the pool *is* being free.
//!
//! ```text
//!  submitters ──▶ [ submission queue (M) ] ──▶ supervisor ──▶ slot ──▶ worker
//!                                                  ▲                     │
//!                                                  └── [ pool (N) ] ◀────┘
//!                                                        idle slots
//! ```

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::job::{BoxedJob, Job};
use super::queue::SubmissionReceiver;
use super::worker::{Worker, WorkerHandle, WorkerSlot, WorkerState, WorkerStateCell, WorkerStats};
use crate::error::{ErrorCode, Result, TidepoolError};
use crate::telemetry::JobMetrics;

/// Source of worker identifiers.
pub type WorkerIdSource = Box<dyn Fn() -> Result<Uuid> + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// Task Accounting
// ═══════════════════════════════════════════════════════════════════════════════

/// Counts tasks spawned by a dispatcher that have not yet finished.
#[derive(Debug, Clone, Default)]
struct LiveTasks(Arc<AtomicUsize>);

impl LiveTasks {
    fn guard(&self) -> TaskGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        TaskGuard(self.0.clone())
    }

    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Held by a spawned task for its whole life.
struct TaskGuard(Arc<AtomicUsize>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Flips the shutdown flag when the supervisor task ends, unwinding included.
struct ShutdownGuard(Arc<watch::Sender<bool>>);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("Dispatcher supervisor task panicked");
        }
        self.0.send_replace(true);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Dispatcher-wide counters.
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    /// Jobs handed to a worker slot
    pub dispatched: Arc<AtomicU64>,
    /// Jobs dequeued but dropped because shutdown began first
    pub abandoned: Arc<AtomicU64>,
    pub workers: WorkerStats,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub abandoned: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panicked: u64,
    pub active: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            processed: self.workers.processed(),
            succeeded: self.workers.succeeded(),
            failed: self.workers.failed(),
            panicked: self.workers.panicked(),
            active: self.workers.active(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns N workers, the pool-of-slots and the supervisor task.
pub struct Dispatcher {
    max_workers: usize,
    pool_tx: mpsc::Sender<WorkerSlot>,
    pool_rx: Mutex<Option<mpsc::Receiver<WorkerSlot>>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    stop_rx: Mutex<Option<oneshot::Receiver<()>>>,
    /// Present once `run` succeeded; completion is observed through `stopped`
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Set once every owned task has terminated
    stopped: Arc<watch::Sender<bool>>,
    workers: Arc<RwLock<Vec<(Uuid, WorkerStateCell)>>>,
    id_source: WorkerIdSource,
    stats: DispatcherStats,
    live: LiveTasks,
}

impl Dispatcher {
    /// Allocate a dispatcher for `max_workers` workers. Spawns nothing.
    pub fn new(max_workers: usize) -> Result<Self> {
        Self::with_id_source(max_workers, Box::new(|| Ok(Uuid::new_v4())))
    }

    /// Like [`Dispatcher::new`] with a custom worker id generator.
    pub fn with_id_source(max_workers: usize, id_source: WorkerIdSource) -> Result<Self> {
        if max_workers == 0 {
            return Err(TidepoolError::dispatcher_construction(
                "a dispatcher needs at least one worker",
            ));
        }

        let (pool_tx, pool_rx) = mpsc::channel(max_workers);
        let (stop_tx, stop_rx) = oneshot::channel();

        Ok(Self {
            max_workers,
            pool_tx,
            pool_rx: Mutex::new(Some(pool_rx)),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx: Mutex::new(Some(stop_rx)),
            supervisor: Mutex::new(None),
            stopped: Arc::new(watch::channel(false).0),
            workers: Arc::new(RwLock::new(Vec::with_capacity(max_workers))),
            id_source,
            stats: DispatcherStats::default(),
            live: LiveTasks::default(),
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Start the workers and the supervisor loop consuming `submissions`.
    ///
    /// Worker ids are all generated before anything is spawned, so an id
    /// failure leaves no task behind. Must be called from within a tokio
    /// runtime, and only once.
    pub fn run(&self, submissions: SubmissionReceiver) -> Result<()> {
        // Held until the supervisor is registered so a racing exit() sees
        // either no dispatcher at all or a fully started one.
        let stop_tx = self.stop_tx.lock();
        if stop_tx.is_none() {
            return Err(TidepoolError::new(
                ErrorCode::DispatcherAlreadyRunning,
                "dispatcher has already been stopped",
            ));
        }

        let mut pool_rx_guard = self.pool_rx.lock();
        if pool_rx_guard.is_none() {
            return Err(TidepoolError::new(
                ErrorCode::DispatcherAlreadyRunning,
                "dispatcher is already running",
            ));
        }

        let ids = self.generate_worker_ids()?;

        let (pool_rx, stop_rx) = match (pool_rx_guard.take(), self.stop_rx.lock().take()) {
            (Some(pool_rx), Some(stop_rx)) => (pool_rx, stop_rx),
            _ => {
                return Err(TidepoolError::new(
                    ErrorCode::DispatcherAlreadyRunning,
                    "dispatcher is already running",
                ))
            }
        };
        drop(pool_rx_guard);

        let mut handles = Vec::with_capacity(self.max_workers);
        {
            let mut registry = self.workers.write();
            for id in ids {
                let (worker, stop) = Worker::new(id, self.pool_tx.clone(), self.stats.workers.clone());
                let state = worker.state();
                let guard = self.live.guard();
                let task = tokio::spawn(async move {
                    let _guard = guard;
                    worker.run().await;
                });
                registry.push((id, state.clone()));
                handles.push(WorkerHandle::from_parts(id, state, stop, task));
            }
        }

        let supervisor = Supervisor {
            submissions,
            pool_rx,
            pool_tx: self.pool_tx.clone(),
            stop_rx,
            handles,
            stats: self.stats.clone(),
        };
        let guard = self.live.guard();
        let stopped = ShutdownGuard(self.stopped.clone());
        let task = tokio::spawn(async move {
            let _stopped = stopped;
            let _guard = guard;
            supervisor.run().await;
        });
        *self.supervisor.lock() = Some(task);
        drop(stop_tx);

        tracing::info!(max_workers = self.max_workers, "Dispatcher started");
        Ok(())
    }

    fn generate_worker_ids(&self) -> Result<Vec<Uuid>> {
        let mut seen = HashSet::with_capacity(self.max_workers);
        let mut ids = Vec::with_capacity(self.max_workers);
        for _ in 0..self.max_workers {
            let id = (self.id_source)().map_err(|e| {
                TidepoolError::new(
                    ErrorCode::WorkerIdGenerationFailed,
                    format!("worker id generation failed: {}", e.message()),
                )
            })?;
            if !seen.insert(id) {
                return Err(TidepoolError::new(
                    ErrorCode::WorkerIdGenerationFailed,
                    format!("duplicate worker id {}", id),
                ));
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Stop the dispatcher and wait for every owned task to finish.
    ///
    /// Jobs already executing run to completion; jobs still queued are
    /// abandoned. Safe to call any number of times, concurrently too: only
    /// the first call sends the stop-signal, and every call returns once all
    /// workers are stopped and their tasks have terminated.
    pub async fn exit(&self) {
        let mut stopped = self.stopped.subscribe();
        let initiated = {
            let mut stop_tx = self.stop_tx.lock();
            match stop_tx.take() {
                Some(stop) if self.supervisor.lock().is_some() => {
                    tracing::info!("Dispatcher stopping, waiting for in-flight jobs");
                    let _ = stop.send(());
                    true
                }
                Some(_) => {
                    // Never started: nothing to wait for.
                    self.stopped.send_replace(true);
                    true
                }
                None => {
                    tracing::debug!("Dispatcher exit already requested, waiting");
                    false
                }
            }
        };

        // The sender lives in `self`, so this only ends once the flag is set.
        let _ = stopped.wait_for(|stopped| *stopped).await;

        if initiated {
            tracing::info!(stats = ?self.stats.snapshot(), "Dispatcher stopped");
        }
    }

    /// Worker slots currently waiting in the pool. Never exceeds N.
    pub fn idle_workers(&self) -> usize {
        self.pool_tx.max_capacity() - self.pool_tx.capacity()
    }

    /// State of every worker created by [`Dispatcher::run`].
    pub fn worker_states(&self) -> Vec<(Uuid, WorkerState)> {
        self.workers
            .read()
            .iter()
            .map(|(id, state)| (*id, state.get()))
            .collect()
    }

    /// Spawned tasks (supervisor and workers) that have not yet finished.
    pub fn live_tasks(&self) -> usize {
        self.live.count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Dropping the stop sender also stops the supervisor; nobody waits.
        if self.stop_tx.get_mut().is_some() && self.supervisor.get_mut().is_some() {
            tracing::warn!("Dispatcher dropped without exit; workers stop in the background");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Supervisor
// ═══════════════════════════════════════════════════════════════════════════════

struct Supervisor {
    submissions: SubmissionReceiver,
    pool_rx: mpsc::Receiver<WorkerSlot>,
    pool_tx: mpsc::Sender<WorkerSlot>,
    stop_rx: oneshot::Receiver<()>,
    handles: Vec<WorkerHandle>,
    stats: DispatcherStats,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let job = tokio::select! {
                biased;
                _ = &mut self.stop_rx => break,
                job = self.submissions.recv() => match job {
                    Some(job) => job,
                    None => {
                        tracing::info!("All submitters dropped, stopping dispatcher");
                        break;
                    }
                },
            };

            if !self.forward(job).await {
                break;
            }
        }

        self.submissions.close();
        while let Some(job) = self.submissions.try_recv() {
            self.abandon(&*job);
        }

        let tasks: Vec<JoinHandle<()>> = self
            .handles
            .into_iter()
            .map(|handle| {
                tracing::debug!(worker_id = %handle.id(), state = %handle.state(), "Stopping worker");
                handle.stop()
            })
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
        JobMetrics::idle_workers(0);
    }

    /// Hand `job` to the next idle worker. Returns false once stop was observed.
    async fn forward(&mut self, mut job: BoxedJob) -> bool {
        loop {
            let slot = tokio::select! {
                biased;
                _ = &mut self.stop_rx => {
                    self.abandon(&*job);
                    return false;
                }
                slot = self.pool_rx.recv() => match slot {
                    Some(slot) => slot,
                    None => {
                        self.abandon(&*job);
                        return false;
                    }
                },
            };

            let worker_id = slot.worker_id();
            let kind = job.identifier().to_string();
            match slot.deliver(job).await {
                Ok(()) => {
                    self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                    JobMetrics::dispatched(&kind);
                    JobMetrics::idle_workers(self.pool_tx.max_capacity() - self.pool_tx.capacity());
                    tracing::debug!(worker_id = %worker_id, job = %kind, "Job dispatched");
                    return true;
                }
                Err(returned) => {
                    tracing::debug!(worker_id = %worker_id, job = %kind, "Stale worker slot, retrying");
                    job = returned;
                }
            }
        }
    }

    fn abandon(&self, job: &dyn Job) {
        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
        JobMetrics::abandoned(job.identifier());
        tracing::warn!(job = %job.identifier(), "Job abandoned during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_workers_rejected() {
        let err = Dispatcher::new(0).err().unwrap();
        assert_eq!(err.code(), ErrorCode::DispatcherConstructionFailed);
    }

    #[test]
    fn test_construction_spawns_nothing() {
        let dispatcher = Dispatcher::new(3).unwrap();
        assert_eq!(dispatcher.max_workers(), 3);
        assert_eq!(dispatcher.live_tasks(), 0);
        assert_eq!(dispatcher.idle_workers(), 0);
        assert!(dispatcher.worker_states().is_empty());
    }

    #[tokio::test]
    async fn test_failing_id_source_aborts_startup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let dispatcher = Dispatcher::with_id_source(
            3,
            Box::new(move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                    Err(TidepoolError::new(ErrorCode::WorkerIdGenerationFailed, "entropy source unavailable"))
                } else {
                    Ok(Uuid::new_v4())
                }
            }),
        )
        .unwrap();

        let (_submitter, receiver) = crate::jobs::SubmissionQueue::bounded(1).unwrap();
        let err = dispatcher.run(receiver).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WorkerIdGenerationFailed);
        assert_eq!(dispatcher.live_tasks(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let fixed = Uuid::new_v4();
        let dispatcher = Dispatcher::with_id_source(2, Box::new(move || Ok(fixed))).unwrap();
        let (_submitter, receiver) = crate::jobs::SubmissionQueue::bounded(1).unwrap();
        let err = dispatcher.run(receiver).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WorkerIdGenerationFailed);
    }

    #[tokio::test]
    async fn test_run_twice_rejected() {
        let dispatcher = Dispatcher::new(1).unwrap();
        let (_s1, r1) = crate::jobs::SubmissionQueue::bounded(1).unwrap();
        let (_s2, r2) = crate::jobs::SubmissionQueue::bounded(1).unwrap();
        dispatcher.run(r1).unwrap();
        let err = dispatcher.run(r2).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DispatcherAlreadyRunning);
        dispatcher.exit().await;
    }

    #[tokio::test]
    async fn test_exit_before_run() {
        let dispatcher = Dispatcher::new(2).unwrap();
        dispatcher.exit().await;
        let (_submitter, receiver) = crate::jobs::SubmissionQueue::bounded(1).unwrap();
        assert!(dispatcher.run(receiver).is_err());
        assert_eq!(dispatcher.live_tasks(), 0);
    }
}
