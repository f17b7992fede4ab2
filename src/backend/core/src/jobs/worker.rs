//! Worker: a single execution context running one job at a time.
//!
//! A worker owns a capacity-1 inbound channel. Whenever it is idle it
//! publishes a [`WorkerSlot`] (a sender for that channel) into the shared
//! pool-of-slots, then waits for either a job on its inbox or its stop-signal.
//! Only idle workers ever appear in the pool, so whoever reads the pool gets
//! a worker that is ready right now.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::job::BoxedJob;
use crate::telemetry::metrics::{JobMetrics, JobOutcome};

// ═══════════════════════════════════════════════════════════════════════════════
// Worker State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle of a worker.
///
/// `Created -> Running -> Idle <-> Executing -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Running = 1,
    Idle = 2,
    Executing = 3,
    Stopping = 4,
    Stopped = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Idle,
            3 => Self::Executing,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::Executing => write!(f, "executing"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared, lock-free view of a worker's state.
#[derive(Debug, Clone)]
pub struct WorkerStateCell(Arc<AtomicU8>);

impl WorkerStateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Created as u8)))
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Counters shared by every worker of a dispatcher.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Jobs that returned (any outcome)
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    /// Jobs whose `run` returned an error
    pub failed: Arc<AtomicU64>,
    /// Jobs whose `run` panicked
    pub panicked: Arc<AtomicU64>,
    /// Jobs currently executing
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Slot
// ═══════════════════════════════════════════════════════════════════════════════

/// The inbound slot of an idle worker, as published into the pool.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    worker_id: Uuid,
    tx: mpsc::Sender<BoxedJob>,
}

impl WorkerSlot {
    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Hand a job to the worker behind this slot.
    ///
    /// Fails, returning the job, if the worker has already stopped.
    pub async fn deliver(self, job: BoxedJob) -> Result<(), BoxedJob> {
        self.tx.send(job).await.map_err(|e| e.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// A single execution context.
pub struct Worker {
    id: Uuid,
    slot: WorkerSlot,
    inbox: mpsc::Receiver<BoxedJob>,
    pool: mpsc::Sender<WorkerSlot>,
    stop: oneshot::Receiver<()>,
    state: WorkerStateCell,
    stats: WorkerStats,
}

impl Worker {
    /// Create a worker that publishes into `pool`.
    ///
    /// Returns the worker and the sending half of its stop-signal.
    pub fn new(
        id: Uuid,
        pool: mpsc::Sender<WorkerSlot>,
        stats: WorkerStats,
    ) -> (Self, oneshot::Sender<()>) {
        let (tx, inbox) = mpsc::channel(1);
        let (stop_tx, stop) = oneshot::channel();

        let worker = Self {
            id,
            slot: WorkerSlot { worker_id: id, tx },
            inbox,
            pool,
            stop,
            state: WorkerStateCell::new(),
            stats,
        };
        (worker, stop_tx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> WorkerStateCell {
        self.state.clone()
    }

    /// Start the worker on the runtime and return a handle for stopping it.
    pub fn start(self, stop: oneshot::Sender<()>) -> WorkerHandle {
        let id = self.id;
        let state = self.state.clone();
        let task = tokio::spawn(self.run());
        WorkerHandle::from_parts(id, state, stop, task)
    }

    /// The worker loop. Returns once the stop-signal is observed while idle.
    pub async fn run(mut self) {
        self.state.set(WorkerState::Running);
        tracing::debug!(worker_id = %self.id, "Worker started");

        loop {
            self.state.set(WorkerState::Idle);

            if self.pool.send(self.slot.clone()).await.is_err() {
                tracing::debug!(worker_id = %self.id, "Worker pool closed");
                break;
            }
            JobMetrics::idle_workers(self.pool.max_capacity() - self.pool.capacity());

            // A job already delivered wins over a concurrent stop.
            tokio::select! {
                biased;
                job = self.inbox.recv() => match job {
                    Some(job) => self.execute(job).await,
                    None => break,
                },
                _ = &mut self.stop => break,
            }
        }

        // Stop is only sent once the supervisor has stopped forwarding, so
        // nothing can be sitting in the inbox here.
        self.state.set(WorkerState::Stopping);
        self.state.set(WorkerState::Stopped);
        tracing::debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn execute(&mut self, mut job: BoxedJob) {
        self.state.set(WorkerState::Executing);
        self.stats.active.fetch_add(1, Ordering::Relaxed);

        let kind = job.identifier().to_string();
        let started = Instant::now();
        tracing::info!(
            worker_id = %self.id,
            job = %kind,
            queued_ms = (chrono::Utc::now() - job.enqueue_time()).num_milliseconds(),
            "Job started"
        );

        let outcome = AssertUnwindSafe(job.run()).catch_unwind().await;
        let elapsed = started.elapsed();

        let outcome = match outcome {
            Ok(Ok(())) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    worker_id = %self.id,
                    job = %kind,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                JobOutcome::Succeeded
            }
            Ok(Err(error)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    worker_id = %self.id,
                    job = %kind,
                    error_kind = %error.kind,
                    error = %error,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job failed"
                );
                JobOutcome::Failed
            }
            Err(panic) => {
                self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    worker_id = %self.id,
                    job = %kind,
                    panic = %panic_message(panic.as_ref()),
                    "Job panicked"
                );
                JobOutcome::Panicked
            }
        };

        drop(job);
        JobMetrics::finished(&kind, outcome, elapsed);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Owner's handle to a started worker.
pub struct WorkerHandle {
    id: Uuid,
    state: WorkerStateCell,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn from_parts(
        id: Uuid,
        state: WorkerStateCell,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            state,
            stop,
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Signal stop and return the worker's task so the caller can await it.
    ///
    /// Consuming the handle guarantees the signal is sent exactly once. A
    /// worker that is executing finishes its job before it observes the stop.
    pub fn stop(self) -> JoinHandle<()> {
        let _ = self.stop.send(());
        self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{Job, JobError, JobResult};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Sleep(Duration),
    }

    struct TestJob {
        behaviour: Behaviour,
        enqueued: DateTime<Utc>,
    }

    fn job(behaviour: Behaviour) -> BoxedJob {
        Box::new(TestJob {
            behaviour,
            enqueued: Utc::now(),
        })
    }

    #[async_trait]
    impl Job for TestJob {
        fn identifier(&self) -> &str {
            "test"
        }

        fn enqueue_time(&self) -> DateTime<Utc> {
            self.enqueued
        }

        async fn run(&mut self) -> JobResult {
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(JobError::failed("boom")),
                Behaviour::Panic => panic!("worker test panic"),
                Behaviour::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(())
                }
            }
        }
    }

    fn spawn_worker() -> (WorkerHandle, mpsc::Receiver<WorkerSlot>, WorkerStats) {
        let (pool_tx, pool_rx) = mpsc::channel(1);
        let stats = WorkerStats::new();
        let (worker, stop) = Worker::new(Uuid::new_v4(), pool_tx, stats.clone());
        (worker.start(stop), pool_rx, stats)
    }

    #[tokio::test]
    async fn test_worker_publishes_slot_when_idle() {
        let (handle, mut pool, _) = spawn_worker();
        let slot = pool.recv().await.unwrap();
        assert_eq!(slot.worker_id(), handle.id());
        assert_eq!(handle.state(), WorkerState::Idle);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_runs_job_and_republishes() {
        let (handle, mut pool, stats) = spawn_worker();

        let slot = pool.recv().await.unwrap();
        slot.deliver(job(Behaviour::Succeed)).await.unwrap();

        // Second publication happens only after the job returned.
        let _again = pool.recv().await.unwrap();
        assert_eq!(stats.succeeded(), 1);
        assert_eq!(stats.processed(), 1);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_and_panic_do_not_stop_worker() {
        let (handle, mut pool, stats) = spawn_worker();

        pool.recv().await.unwrap().deliver(job(Behaviour::Fail)).await.unwrap();
        pool.recv().await.unwrap().deliver(job(Behaviour::Panic)).await.unwrap();
        pool.recv().await.unwrap().deliver(job(Behaviour::Succeed)).await.unwrap();
        let _idle = pool.recv().await.unwrap();

        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.panicked(), 1);
        assert_eq!(stats.succeeded(), 1);
        assert_eq!(stats.processed(), 3);
        assert_eq!(handle.state(), WorkerState::Idle);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_job() {
        let (handle, mut pool, stats) = spawn_worker();
        let state = handle.state.clone();

        pool.recv()
            .await
            .unwrap()
            .deliver(job(Behaviour::Sleep(Duration::from_millis(200))))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.get(), WorkerState::Executing);

        let started = tokio::time::Instant::now();
        handle.stop().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(190));
        assert_eq!(stats.succeeded(), 1);
        assert_eq!(state.get(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_stale_slot_returns_job() {
        let (handle, mut pool, _) = spawn_worker();
        let slot = pool.recv().await.unwrap();
        handle.stop().await.unwrap();

        let returned = slot.deliver(job(Behaviour::Succeed)).await.unwrap_err();
        assert_eq!(returned.identifier(), "test");
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
    }
}
