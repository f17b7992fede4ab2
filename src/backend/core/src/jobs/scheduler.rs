//! Periodic submission of maintenance jobs.
//!
//! Each schedule entry owns one ticker task. On every tick the task builds
//! the kind from the registry and submits it like any other producer, so
//! scheduled jobs share the queue's backpressure.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::queue::Submitter;
use super::registry::JobRegistry;
use crate::error::{ErrorCode, Result, TidepoolError};

/// One `kind@interval` schedule entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub kind: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl ScheduleEntry {
    pub fn new(kind: impl Into<String>, interval: Duration) -> Self {
        Self {
            kind: kind.into(),
            interval,
        }
    }

    /// Parse a single `kind@interval` entry, e.g. `recommender@1h`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (kind, interval) = raw
            .trim()
            .split_once('@')
            .ok_or_else(|| invalid(raw, "expected kind@interval"))?;

        let kind = kind.trim();
        if kind.is_empty() {
            return Err(invalid(raw, "kind is empty"));
        }

        let interval = humantime_serde::re::humantime::parse_duration(interval.trim())
            .map_err(|e| invalid(raw, e))?;
        if interval.is_zero() {
            return Err(invalid(raw, "interval must be positive"));
        }

        Ok(Self::new(kind, interval))
    }

    /// Parse a comma separated list. Blank input means no schedule.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        raw.split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

fn invalid(raw: &str, reason: impl std::fmt::Display) -> TidepoolError {
    TidepoolError::invalid_configuration("SCHEDULED_JOBS", format!("{:?}: {}", raw, reason))
}

/// Drives the configured schedule.
pub struct JobScheduler {
    registry: Arc<JobRegistry>,
    submitter: Submitter,
    entries: Vec<ScheduleEntry>,
    cancel: CancellationToken,
    tickers: JoinSet<()>,
}

impl JobScheduler {
    pub fn new(registry: Arc<JobRegistry>, submitter: Submitter) -> Self {
        Self {
            registry,
            submitter,
            entries: Vec::new(),
            cancel: CancellationToken::new(),
            tickers: JoinSet::new(),
        }
    }

    /// Add an entry. Kinds the registry does not know are rejected here.
    pub fn add(&mut self, entry: ScheduleEntry) -> Result<()> {
        if !self.registry.contains(&entry.kind) {
            return Err(TidepoolError::unknown_job_kind(&entry.kind));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Spawn one ticker per entry. The first submission happens one interval
    /// after start.
    pub fn start(&mut self) {
        for entry in std::mem::take(&mut self.entries) {
            let registry = self.registry.clone();
            let submitter = self.submitter.clone();
            let cancel = self.cancel.child_token();

            tracing::info!(job = %entry.kind, interval = ?entry.interval, "Scheduling job");
            self.tickers
                .spawn(tick(entry, registry, submitter, cancel));
        }
    }

    /// Number of running tickers.
    pub fn active(&self) -> usize {
        self.tickers.len()
    }

    /// Cancel every ticker and wait for them.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(result) = self.tickers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Scheduler ticker failed");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn tick(
    entry: ScheduleEntry,
    registry: Arc<JobRegistry>,
    submitter: Submitter,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + entry.interval;
    let mut ticker = tokio::time::interval_at(start, entry.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let submitted = tokio::select! {
            _ = cancel.cancelled() => break,
            result = registry.submit(&submitter, &entry.kind, None) => result,
        };

        match submitted {
            Ok(()) => tracing::debug!(job = %entry.kind, "Scheduled job submitted"),
            Err(e) if e.code() == ErrorCode::QueueClosed => {
                tracing::warn!(job = %entry.kind, "Submission queue closed, ticker stopping");
                break;
            }
            Err(e) => tracing::warn!(job = %entry.kind, error = %e, "Scheduled submission failed"),
        }
    }
}
