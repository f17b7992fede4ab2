//! Job definitions and traits.
//!
//! - **Job trait**: the contract every executable task satisfies
//! - **JobError**: typed whole-job failure returned from `run`
//! - **with_deadline**: per-call timeout for external I/O inside a job

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Broad class of a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// A collaborator (database, cluster API) was unreachable or failed
    Infrastructure,
    /// Construction-time options were unusable (e.g. an unparsable TTL)
    Configuration,
    /// The injected payload could not be decoded
    InvalidPayload,
    /// An external call exceeded its deadline
    Timeout,
    /// Anything else the job reports
    Failed,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Configuration => write!(f, "configuration"),
            Self::InvalidPayload => write!(f, "invalid_payload"),
            Self::Timeout => write!(f, "timeout"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Error type for job execution failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    /// Optional machine-readable code
    pub code: Option<String>,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Infrastructure, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Configuration, message)
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::InvalidPayload, message)
    }

    pub fn timeout(label: &str, after: Duration) -> Self {
        Self::new(
            JobErrorKind::Timeout,
            format!("{} timed out after {}ms", label, after.as_millis()),
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Failed, message)
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        Self::invalid_payload(format!("payload is not valid JSON: {}", error))
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A unit of work executed by a worker.
///
/// Ownership enforces the lifecycle: a job is moved into the submission queue,
/// moved to exactly one worker, run once and dropped. `set_payload` can only
/// be called by whoever owns the job before it is submitted, so it always
/// happens-before `run`.
///
/// `run` must keep two classes of error apart. Failures confined to one item
/// of a sweep (one cluster, one release) are logged and skipped; only
/// failures that make the whole job meaningless are returned.
#[async_trait]
pub trait Job: Send + 'static {
    /// Stable, non-empty kind name.
    fn identifier(&self) -> &str;

    /// When the job was created by its submitter.
    fn enqueue_time(&self) -> DateTime<Utc>;

    /// Inject the raw submission body. Kinds without input ignore it.
    fn set_payload(&mut self, _payload: &[u8]) -> JobResult {
        Ok(())
    }

    /// Execute the job. Re-running a logical job must not corrupt external state.
    async fn run(&mut self) -> JobResult;
}

/// A type-erased job as carried by the queue and the worker slots.
pub type BoxedJob = Box<dyn Job>;

impl fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("identifier", &self.identifier())
            .field("enqueue_time", &self.enqueue_time())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Deadlines
// ═══════════════════════════════════════════════════════════════════════════════

/// Run one external call under a deadline.
///
/// The call's own error is converted into a [`JobError`]; an elapsed deadline
/// becomes [`JobErrorKind::Timeout`].
pub async fn with_deadline<T, E, F>(label: &str, deadline: Duration, call: F) -> Result<T, JobError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<JobError>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(JobError::timeout(label, deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop {
        enqueued: DateTime<Utc>,
    }

    #[async_trait]
    impl Job for Noop {
        fn identifier(&self) -> &str {
            "noop"
        }

        fn enqueue_time(&self) -> DateTime<Utc> {
            self.enqueued
        }

        async fn run(&mut self) -> JobResult {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_set_payload_is_noop() {
        let mut job: BoxedJob = Box::new(Noop { enqueued: Utc::now() });
        assert!(job.set_payload(b"{ not json").is_ok());
        assert!(job.run().await.is_ok());
        assert_eq!(job.identifier(), "noop");
    }

    #[test]
    fn test_job_error_display() {
        let err = JobError::infrastructure("db unreachable").with_code("DB");
        assert_eq!(err.to_string(), "infrastructure: db unreachable (code: DB)");
    }

    #[test]
    fn test_json_error_is_invalid_payload() {
        let err: JobError = serde_json::from_slice::<serde_json::Value>(b"{oops").unwrap_err().into();
        assert_eq!(err.kind, JobErrorKind::InvalidPayload);
        assert!(err.message.starts_with("payload is not valid JSON"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let result: Result<(), JobError> = with_deadline(
            "list namespaces",
            Duration::from_secs(5),
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), JobError>(())
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Timeout);
        assert!(err.message.contains("list namespaces"));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_through() {
        let value = with_deadline("fast", Duration::from_secs(1), async { Ok::<_, JobError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
