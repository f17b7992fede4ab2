//! Configuration management.
//!
//! Everything is read from the process environment (optionally seeded from a
//! `.env` file by the binary). `MAX_WORKERS` and `MAX_QUEUE` are required and
//! have no default; every other setting falls back to a default.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, TidepoolError};
use crate::jobs::scheduler::ScheduleEntry;
use crate::telemetry::{LogFormat, LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker pool size N
    pub max_workers: usize,

    /// Submission queue capacity M
    pub max_queue: usize,

    /// Settings shared by the built-in jobs
    pub jobs: JobsConfig,

    /// Periodic submissions
    pub schedule: Vec<ScheduleEntry>,

    pub logging: LoggingConfig,

    pub metrics: MetricsConfig,
}

/// Construction-time options for the built-in job kinds.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Helm revisions kept per release
    pub helm_revisions_threshold: usize,

    /// Raw preview environment TTL, parsed by the reaper when it runs
    pub preview_env_ttl: String,

    /// Page size for paged sweeps
    pub sweep_page_size: usize,

    /// Deadline applied to each external call
    pub external_call_timeout: Duration,

    /// How long archived recommendations are kept
    pub recommender_archive_retention: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            helm_revisions_threshold: default_helm_revisions_threshold(),
            preview_env_ttl: default_preview_env_ttl(),
            sweep_page_size: default_sweep_page_size(),
            external_call_timeout: default_external_call_timeout(),
            recommender_archive_retention: default_recommender_archive_retention(),
        }
    }
}

/// Flat view of the environment, before validation.
#[derive(Debug, Deserialize)]
struct EnvConfig {
    max_workers: Option<String>,

    max_queue: Option<String>,

    #[serde(default = "default_helm_revisions_threshold")]
    helm_revisions_threshold: usize,

    #[serde(default = "default_preview_env_ttl")]
    preview_env_ttl: String,

    #[serde(default = "default_sweep_page_size")]
    sweep_page_size: usize,

    #[serde(default = "default_external_call_timeout", with = "humantime_serde")]
    external_call_timeout: Duration,

    #[serde(default = "default_recommender_archive_retention", with = "humantime_serde")]
    recommender_archive_retention: Duration,

    #[serde(default)]
    scheduled_jobs: String,

    #[serde(default = "default_log_level")]
    log_level: String,

    #[serde(default)]
    log_format: LogFormat,

    #[serde(default)]
    metrics_addr: Option<String>,
}

// Default value functions
fn default_helm_revisions_threshold() -> usize { 100 }
fn default_preview_env_ttl() -> String { "168h".to_string() }
fn default_sweep_page_size() -> usize { 100 }
fn default_external_call_timeout() -> Duration { Duration::from_secs(10) }
fn default_recommender_archive_retention() -> Duration { Duration::from_secs(30 * 24 * 3600) }
fn default_log_level() -> String { "info".to_string() }

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_source(config::Environment::default())
    }

    /// Load configuration from an explicit environment source.
    ///
    /// Tests pass `Environment::default().source(Some(map))` so they never
    /// touch the real process environment.
    pub fn from_source(source: config::Environment) -> Result<Self> {
        let raw: EnvConfig = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;

        let max_workers = parse_positive("MAX_WORKERS", raw.max_workers.as_deref())?;
        let max_queue = parse_positive("MAX_QUEUE", raw.max_queue.as_deref())?;

        if raw.helm_revisions_threshold == 0 {
            return Err(TidepoolError::invalid_configuration(
                "HELM_REVISIONS_THRESHOLD",
                "must keep at least one revision",
            ));
        }
        if raw.sweep_page_size == 0 {
            return Err(TidepoolError::invalid_configuration(
                "SWEEP_PAGE_SIZE",
                "must be a positive integer",
            ));
        }

        let metrics = match raw.metrics_addr.as_deref().map(str::trim) {
            None | Some("") => MetricsConfig::default(),
            Some(addr) => MetricsConfig {
                listen_addr: Some(addr.parse().map_err(|e| {
                    TidepoolError::invalid_configuration("METRICS_ADDR", e)
                })?),
            },
        };

        Ok(Self {
            max_workers,
            max_queue,
            jobs: JobsConfig {
                helm_revisions_threshold: raw.helm_revisions_threshold,
                preview_env_ttl: raw.preview_env_ttl,
                sweep_page_size: raw.sweep_page_size,
                external_call_timeout: raw.external_call_timeout,
                recommender_archive_retention: raw.recommender_archive_retention,
            },
            schedule: ScheduleEntry::parse_list(&raw.scheduled_jobs)?,
            logging: LoggingConfig {
                level: raw.log_level,
                format: raw.log_format,
                ..LoggingConfig::default()
            },
            metrics,
        })
    }
}

fn parse_positive(key: &str, value: Option<&str>) -> Result<usize> {
    let value = match value.map(str::trim) {
        None | Some("") => return Err(TidepoolError::missing_configuration(key)),
        Some(v) => v,
    };

    match value.parse::<usize>() {
        Ok(0) => Err(TidepoolError::invalid_configuration(key, "must be a positive integer")),
        Ok(n) => Ok(n),
        Err(e) => Err(TidepoolError::invalid_configuration(
            key,
            format!("{:?} is not a positive integer ({})", value, e),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::default().source(Some(map))
    }

    #[test]
    fn test_required_values() {
        let config = Config::from_source(env(&[("MAX_WORKERS", "4"), ("MAX_QUEUE", "16")])).unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_queue, 16);
        assert_eq!(config.jobs.helm_revisions_threshold, 100);
        assert_eq!(config.jobs.sweep_page_size, 100);
        assert_eq!(config.jobs.external_call_timeout, Duration::from_secs(10));
        assert!(config.schedule.is_empty());
        assert!(config.metrics.listen_addr.is_none());
    }

    #[test]
    fn test_missing_max_workers() {
        let err = Config::from_source(env(&[("MAX_QUEUE", "16")])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
        assert!(err.message().contains("MAX_WORKERS"));
    }

    #[test]
    fn test_missing_max_queue() {
        let err = Config::from_source(env(&[("MAX_WORKERS", "2")])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
        assert!(err.message().contains("MAX_QUEUE"));
    }

    #[test]
    fn test_non_numeric_is_invalid() {
        let err = Config::from_source(env(&[("MAX_WORKERS", "many"), ("MAX_QUEUE", "1")])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
        assert!(err.message().contains("many"));
    }

    #[test]
    fn test_zero_is_invalid() {
        let err = Config::from_source(env(&[("MAX_WORKERS", "1"), ("MAX_QUEUE", "0")])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_optional_overrides() {
        let config = Config::from_source(env(&[
            ("MAX_WORKERS", "1"),
            ("MAX_QUEUE", "1"),
            ("HELM_REVISIONS_THRESHOLD", "20"),
            ("PREVIEW_ENV_TTL", "2h"),
            ("EXTERNAL_CALL_TIMEOUT", "5s"),
            ("LOG_FORMAT", "compact"),
            ("METRICS_ADDR", "127.0.0.1:9100"),
            ("SCHEDULED_JOBS", "recommender@30m"),
        ]))
        .unwrap();

        assert_eq!(config.jobs.helm_revisions_threshold, 20);
        assert_eq!(config.jobs.preview_env_ttl, "2h");
        assert_eq!(config.jobs.external_call_timeout, Duration::from_secs(5));
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert!(config.metrics.listen_addr.is_some());
        assert_eq!(config.schedule.len(), 1);
        assert_eq!(config.schedule[0].kind, "recommender");
    }
}
