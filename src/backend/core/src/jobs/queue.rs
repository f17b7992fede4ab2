//! Bounded submission queue.
//!
//! Producers (the front-door, the scheduler) hold cloneable [`Submitter`]s;
//! the dispatcher owns the single [`SubmissionReceiver`]. A full queue makes
//! `submit` wait, which is the admission control for the whole service.

use tokio::sync::mpsc;

use super::job::BoxedJob;
use crate::error::{ErrorCode, Result, TidepoolError};
use crate::telemetry::JobMetrics;

/// Constructor namespace for the submission queue.
pub struct SubmissionQueue;

impl SubmissionQueue {
    /// Create a queue holding at most `capacity` jobs.
    pub fn bounded(capacity: usize) -> Result<(Submitter, SubmissionReceiver)> {
        if capacity == 0 {
            return Err(TidepoolError::invalid_configuration(
                "MAX_QUEUE",
                "must be a positive integer",
            ));
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok((Submitter { tx }, SubmissionReceiver { rx }))
    }
}

/// Write handle to the submission queue.
#[derive(Clone)]
pub struct Submitter {
    tx: mpsc::Sender<BoxedJob>,
}

/// Error returned by [`Submitter::try_submit`], handing the job back.
#[derive(Debug)]
pub enum TrySubmitError {
    Full(BoxedJob),
    Closed(BoxedJob),
}

impl TrySubmitError {
    pub fn into_job(self) -> BoxedJob {
        match self {
            Self::Full(job) | Self::Closed(job) => job,
        }
    }
}

impl From<&TrySubmitError> for TidepoolError {
    fn from(error: &TrySubmitError) -> Self {
        match error {
            TrySubmitError::Full(job) => TidepoolError::new(
                ErrorCode::QueueFull,
                format!("submission queue is full, rejected {}", job.identifier()),
            ),
            TrySubmitError::Closed(_) => TidepoolError::queue_closed(),
        }
    }
}

impl Submitter {
    /// Enqueue a job, waiting while the queue is full.
    pub async fn submit(&self, job: BoxedJob) -> Result<()> {
        let kind = job.identifier().to_string();
        self.tx
            .send(job)
            .await
            .map_err(|_| TidepoolError::queue_closed())?;

        JobMetrics::submitted(&kind);
        tracing::debug!(job = %kind, "Job submitted");
        Ok(())
    }

    /// Enqueue a job only if there is room right now.
    pub fn try_submit(&self, job: BoxedJob) -> std::result::Result<(), TrySubmitError> {
        let kind = job.identifier().to_string();
        match self.tx.try_send(job) {
            Ok(()) => {
                JobMetrics::submitted(&kind);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => Err(TrySubmitError::Full(job)),
            Err(mpsc::error::TrySendError::Closed(job)) => Err(TrySubmitError::Closed(job)),
        }
    }

    /// Jobs currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free places left before `submit` starts waiting.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }

    /// Maximum number of queued jobs.
    pub fn max_capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Whether the dispatcher side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read handle, owned by the dispatcher.
pub struct SubmissionReceiver {
    rx: mpsc::Receiver<BoxedJob>,
}

impl SubmissionReceiver {
    /// Next job in FIFO order. `None` once every submitter is gone.
    pub async fn recv(&mut self) -> Option<BoxedJob> {
        self.rx.recv().await
    }

    /// Next job if one is waiting right now.
    pub fn try_recv(&mut self) -> Option<BoxedJob> {
        self.rx.try_recv().ok()
    }

    /// Refuse further submissions. Jobs already queued can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
