//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: `tracing` events rendered as JSON, pretty or compact text
//! - **Metrics**: job outcome counters, worker gauges and duration histograms
//!
//! # Example
//!
//! ```rust,no_run
//! use tidepool_core::telemetry::{TelemetryConfig, init_telemetry};
//!
//! let config = TelemetryConfig::default();
//! init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use self::logging::{init_logging, LogFormat, LoggingConfig};
pub use self::metrics::{init_metrics, JobMetrics, MetricsConfig, MetricsHandle};

/// Unified telemetry configuration.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Initialize logging, then metrics.
///
/// Must be called from inside a tokio runtime when a metrics listener is
/// configured.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<MetricsHandle> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics)
}
