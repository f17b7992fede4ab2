//! Prometheus metrics for job dispatch and execution.
//!
//! Recording is always cheap: without an installed recorder the `metrics`
//! macros are no-ops, so library code records unconditionally.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

pub const JOBS_SUBMITTED: &str = "tidepool_jobs_submitted_total";
pub const JOBS_DISPATCHED: &str = "tidepool_jobs_dispatched_total";
pub const JOBS_FINISHED: &str = "tidepool_jobs_finished_total";
pub const JOBS_ABANDONED: &str = "tidepool_jobs_abandoned_total";
pub const JOB_DURATION: &str = "tidepool_job_duration_seconds";
pub const IDLE_WORKERS: &str = "tidepool_idle_workers";
pub const SWEEP_ITEMS: &str = "tidepool_sweep_items_total";

/// Metrics configuration.
#[derive(Debug, Clone, Default)]
pub struct MetricsConfig {
    /// Prometheus scrape listener; metrics stay in-process when unset
    pub listen_addr: Option<SocketAddr>,
}

/// Returned by [`init_metrics`]; records whether an exporter is running.
#[derive(Debug)]
pub struct MetricsHandle {
    pub listen_addr: Option<SocketAddr>,
}

/// Install the Prometheus exporter if a listener address is configured.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<MetricsHandle> {
    let Some(addr) = config.listen_addr else {
        return Ok(MetricsHandle { listen_addr: None });
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(&[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0])?
        .install()?;

    register_metric_descriptions();

    tracing::info!(address = %addr, "Prometheus exporter listening");

    Ok(MetricsHandle {
        listen_addr: Some(addr),
    })
}

fn register_metric_descriptions() {
    describe_counter!(JOBS_SUBMITTED, "Jobs accepted into the submission queue");
    describe_counter!(JOBS_DISPATCHED, "Jobs handed to an idle worker");
    describe_counter!(JOBS_FINISHED, "Jobs that returned, by kind and outcome");
    describe_counter!(JOBS_ABANDONED, "Jobs dropped because shutdown began first");
    describe_histogram!(JOB_DURATION, "Job run duration in seconds");
    describe_gauge!(IDLE_WORKERS, "Worker slots currently published in the pool");
    describe_counter!(SWEEP_ITEMS, "Items processed by paged sweeps, by outcome");
}

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Panicked,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Panicked => "panicked",
        }
    }
}

/// Recording helpers used by the queue, dispatcher and workers.
pub struct JobMetrics;

impl JobMetrics {
    pub fn submitted(kind: &str) {
        counter!(JOBS_SUBMITTED, "kind" => kind.to_string()).increment(1);
    }

    pub fn dispatched(kind: &str) {
        counter!(JOBS_DISPATCHED, "kind" => kind.to_string()).increment(1);
    }

    pub fn finished(kind: &str, outcome: JobOutcome, elapsed: Duration) {
        counter!(JOBS_FINISHED, "kind" => kind.to_string(), "outcome" => outcome.as_str())
            .increment(1);
        histogram!(JOB_DURATION, "kind" => kind.to_string()).record(elapsed.as_secs_f64());
    }

    pub fn abandoned(kind: &str) {
        counter!(JOBS_ABANDONED, "kind" => kind.to_string()).increment(1);
    }

    pub fn idle_workers(count: usize) {
        gauge!(IDLE_WORKERS).set(count as f64);
    }

    pub fn sweep_items(label: &'static str, succeeded: u64, failed: u64) {
        counter!(SWEEP_ITEMS, "sweep" => label, "outcome" => "succeeded").increment(succeeded);
        counter!(SWEEP_ITEMS, "sweep" => label, "outcome" => "failed").increment(failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_install_nothing() {
        let handle = init_metrics(&MetricsConfig::default()).unwrap();
        assert!(handle.listen_addr.is_none());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        JobMetrics::submitted("noop");
        JobMetrics::finished("noop", JobOutcome::Failed, Duration::from_millis(5));
        JobMetrics::idle_workers(3);
    }
}
