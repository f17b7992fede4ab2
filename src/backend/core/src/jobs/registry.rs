//! Kind name to job constructor mapping.
//!
//! The registry is how anything outside the worker pool (the scheduler, a
//! front-door) turns a kind name and an optional payload into a runnable job.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::job::BoxedJob;
use super::queue::Submitter;
use crate::error::{ErrorCode, Result, TidepoolError};

/// Builds a fresh job stamped with its enqueue time.
pub type JobConstructor = Box<dyn Fn(DateTime<Utc>) -> BoxedJob + Send + Sync>;

/// Registered job kinds.
#[derive(Default)]
pub struct JobRegistry {
    constructors: BTreeMap<String, JobConstructor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kind`. Static options should be captured by `constructor`.
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F) -> Result<()>
    where
        F: Fn(DateTime<Utc>) -> BoxedJob + Send + Sync + 'static,
    {
        let kind = kind.into();
        if kind.is_empty() {
            return Err(TidepoolError::new(
                ErrorCode::InvalidConfiguration,
                "job kind must not be empty",
            ));
        }
        if self.constructors.contains_key(&kind) {
            return Err(TidepoolError::new(
                ErrorCode::InvalidConfiguration,
                format!("job kind {} registered twice", kind),
            ));
        }

        tracing::debug!(job = %kind, "Job kind registered");
        self.constructors.insert(kind, Box::new(constructor));
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kinds in name order.
    pub fn kinds(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Construct a job of `kind` and inject `payload` if given.
    pub fn build(&self, kind: &str, payload: Option<&[u8]>) -> Result<BoxedJob> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| TidepoolError::unknown_job_kind(kind))?;

        let mut job = constructor(Utc::now());
        if let Some(payload) = payload {
            job.set_payload(payload).map_err(|e| {
                TidepoolError::new(
                    ErrorCode::InvalidPayload,
                    format!("{} rejected its payload: {}", kind, e),
                )
            })?;
        }
        Ok(job)
    }

    /// Build a job and enqueue it. Nothing is enqueued when building fails.
    pub async fn submit(&self, submitter: &Submitter, kind: &str, payload: Option<&[u8]>) -> Result<()> {
        let job = self.build(kind, payload)?;
        submitter.submit(job).await
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
