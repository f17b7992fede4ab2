//! Built-in maintenance jobs.
//!
//! Every kind follows the same shape: page through the cluster inventory with
//! a [`PagedSweep`](super::paging::PagedSweep), fan out one subtask per
//! cluster, and wrap every external call in
//! [`with_deadline`](super::job::with_deadline).

mod helm_revisions;
mod preview_ttl;
mod recommender;

pub use helm_revisions::HelmRevisionsCountTracker;
pub use preview_ttl::PreviewDeploymentsTtlDeleter;
pub use recommender::{Recommender, RecommenderPayload};

use std::sync::Arc;
use std::time::Duration;

use super::job::BoxedJob;
use super::registry::JobRegistry;
use crate::config::JobsConfig;
use crate::error::Result;
use crate::inventory::memory::{
    MemoryClusterAgentFactory, MemoryClusterRepository, MemoryEnvironmentRepository,
    MemoryRecommendationRepository, StaticPolicyEngine,
};
use crate::inventory::{
    ClusterAgentFactory, ClusterRepository, EnvironmentRepository, PolicyEngine,
    RecommendationRepository,
};

pub const HELM_REVISIONS_KIND: &str = "helm-revisions-count-tracker";
pub const PREVIEW_TTL_KIND: &str = "preview-deployments-ttl-deleter";
pub const RECOMMENDER_KIND: &str = "recommender";

/// External systems the built-in jobs work against.
#[derive(Clone)]
pub struct Collaborators {
    pub clusters: Arc<dyn ClusterRepository>,
    pub agents: Arc<dyn ClusterAgentFactory>,
    pub environments: Arc<dyn EnvironmentRepository>,
    pub policies: Arc<dyn PolicyEngine>,
    pub recommendations: Arc<dyn RecommendationRepository>,
}

impl Collaborators {
    /// Empty in-process collaborators.
    pub fn in_memory() -> Self {
        Self {
            clusters: Arc::new(MemoryClusterRepository::default()),
            agents: Arc::new(MemoryClusterAgentFactory::new()),
            environments: Arc::new(MemoryEnvironmentRepository::new()),
            policies: Arc::new(StaticPolicyEngine::new()),
            recommendations: Arc::new(MemoryRecommendationRepository::new()),
        }
    }
}

/// Paging and deadline settings shared by every sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    pub page_size: usize,
    pub call_timeout: Duration,
}

impl From<&JobsConfig> for SweepOptions {
    fn from(config: &JobsConfig) -> Self {
        Self {
            page_size: config.sweep_page_size,
            call_timeout: config.external_call_timeout,
        }
    }
}

/// Register the three built-in kinds with options taken from `config`.
pub fn register_builtin(
    registry: &mut JobRegistry,
    collaborators: Collaborators,
    config: &JobsConfig,
) -> Result<()> {
    let options = SweepOptions::from(config);

    let threshold = config.helm_revisions_threshold;
    let c = collaborators.clone();
    registry.register(HELM_REVISIONS_KIND, move |enqueued_at| {
        Box::new(HelmRevisionsCountTracker::new(
            enqueued_at,
            threshold,
            options,
            c.clusters.clone(),
            c.agents.clone(),
        )) as BoxedJob
    })?;

    let ttl = config.preview_env_ttl.clone();
    let c = collaborators.clone();
    registry.register(PREVIEW_TTL_KIND, move |enqueued_at| {
        Box::new(PreviewDeploymentsTtlDeleter::new(
            enqueued_at,
            ttl.clone(),
            options,
            c.clusters.clone(),
            c.agents.clone(),
            c.environments.clone(),
        )) as BoxedJob
    })?;

    let retention = config.recommender_archive_retention;
    let c = collaborators;
    registry.register(RECOMMENDER_KIND, move |enqueued_at| {
        Box::new(Recommender::new(
            enqueued_at,
            retention,
            options,
            c.clusters.clone(),
            c.policies.clone(),
            c.recommendations.clone(),
        )) as BoxedJob
    })?;

    Ok(())
}
