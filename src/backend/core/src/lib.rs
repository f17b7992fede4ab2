#![allow(clippy::result_large_err)]
//! # Tidepool Core
//!
//! Background worker pool for infrastructure maintenance jobs.
//!
//! ## Architecture
//!
//! - **Jobs**: bounded submission queue, dispatcher and fixed-size worker pool
//! - **Built-in jobs**: Helm revision retention, preview environment reaper, policy recommender
//! - **Inventory**: collaborator interfaces the jobs run against
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **Config**: environment-driven configuration

pub mod config;
pub mod error;
pub mod inventory;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, Result, TidepoolError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, JobsConfig};
    pub use crate::error::{ErrorCode, Result, TidepoolError};
    pub use crate::inventory::{
        Cluster, ClusterAgent, ClusterAgentFactory, ClusterFilter, ClusterRepository,
        EnvironmentRepository, InventoryError, PolicyEngine, RecommendationRepository,
    };
    pub use crate::jobs::{
        register_builtin, BoxedJob, Collaborators, Dispatcher, Job, JobError, JobErrorKind,
        JobRegistry, JobResult, JobScheduler, PagedSweep, ScheduleEntry, SubmissionQueue,
        Submitter, WorkerState,
    };
    pub use crate::telemetry::{init_telemetry, JobMetrics, TelemetryConfig};
}
