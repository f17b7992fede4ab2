//! Preview environment TTL reaper.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use super::{SweepOptions, PREVIEW_TTL_KIND};
use crate::inventory::{
    Cluster, ClusterAgent, ClusterAgentFactory, ClusterFilter, ClusterRepository, Deployment,
    Environment, EnvironmentRepository,
};
use crate::jobs::job::{with_deadline, Job, JobError, JobResult};
use crate::jobs::paging::PagedSweep;

/// Deletes preview deployments, and their namespaces, that have not been
/// updated for longer than the TTL.
pub struct PreviewDeploymentsTtlDeleter {
    enqueued_at: DateTime<Utc>,
    /// Kept raw; parsed at run time so a bad value fails the job, not startup
    ttl: String,
    options: SweepOptions,
    clusters: Arc<dyn ClusterRepository>,
    agents: Arc<dyn ClusterAgentFactory>,
    environments: Arc<dyn EnvironmentRepository>,
}

impl PreviewDeploymentsTtlDeleter {
    pub fn new(
        enqueued_at: DateTime<Utc>,
        ttl: impl Into<String>,
        options: SweepOptions,
        clusters: Arc<dyn ClusterRepository>,
        agents: Arc<dyn ClusterAgentFactory>,
        environments: Arc<dyn EnvironmentRepository>,
    ) -> Self {
        Self {
            enqueued_at,
            ttl: ttl.into(),
            options,
            clusters,
            agents,
            environments,
        }
    }

    fn parse_ttl(&self) -> Result<chrono::Duration, JobError> {
        let ttl = humantime_serde::re::humantime::parse_duration(self.ttl.trim())
            .map_err(|e| JobError::configuration(format!("invalid TTL {:?}: {}", self.ttl, e)))?;
        chrono::Duration::from_std(ttl)
            .map_err(|e| JobError::configuration(format!("TTL {:?} out of range: {}", self.ttl, e)))
    }
}

#[async_trait]
impl Job for PreviewDeploymentsTtlDeleter {
    fn identifier(&self) -> &str {
        PREVIEW_TTL_KIND
    }

    fn enqueue_time(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    async fn run(&mut self) -> JobResult {
        let ttl = self.parse_ttl()?;
        let cutoff = Utc::now() - ttl;
        let timeout = self.options.call_timeout;
        let filter = ClusterFilter::PreviewEnvironmentsEnabled;

        let total = with_deadline("count clusters", timeout, self.clusters.count(&filter)).await?;
        tracing::info!(job = PREVIEW_TTL_KIND, clusters = total, ttl = %self.ttl, "Reaping expired preview deployments");

        let clusters = self.clusters.clone();
        let agents = self.agents.clone();
        let environments = self.environments.clone();
        let report = PagedSweep::new(PREVIEW_TTL_KIND, self.options.page_size)
            .run(
                total,
                |page| {
                    let clusters = clusters.clone();
                    let filter = filter.clone();
                    async move { with_deadline("list clusters", timeout, clusters.list(&filter, page)).await }
                },
                |cluster: Cluster| {
                    reap_cluster(agents.clone(), environments.clone(), cluster, cutoff, timeout)
                },
            )
            .await?;

        tracing::info!(job = PREVIEW_TTL_KIND, report = ?report, "Preview reaper finished");
        Ok(())
    }
}

/// One subtask per environment of the cluster.
async fn reap_cluster(
    agents: Arc<dyn ClusterAgentFactory>,
    environments: Arc<dyn EnvironmentRepository>,
    cluster: Cluster,
    cutoff: DateTime<Utc>,
    timeout: Duration,
) -> Result<(), JobError> {
    let agent = with_deadline("connect", timeout, agents.connect(&cluster)).await?;
    let listed = with_deadline("list environments", timeout, environments.environments(cluster.id)).await?;

    let mut subtasks = JoinSet::new();
    for environment in listed {
        subtasks.spawn(reap_environment(
            agent.clone(),
            environments.clone(),
            environment,
            cutoff,
            timeout,
        ));
    }

    while let Some(joined) = subtasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(cluster = %cluster.name, error = %e, "Environment not reaped"),
            Err(e) => tracing::error!(cluster = %cluster.name, error = %e, "Environment subtask aborted"),
        }
    }
    Ok(())
}

async fn reap_environment(
    agent: Arc<dyn ClusterAgent>,
    environments: Arc<dyn EnvironmentRepository>,
    environment: Environment,
    cutoff: DateTime<Utc>,
    timeout: Duration,
) -> Result<(), JobError> {
    let deployments = with_deadline("list deployments", timeout, environments.deployments(environment.id)).await?;

    for deployment in deployments.into_iter().filter(|d| d.last_updated < cutoff) {
        if let Err(e) = reap_deployment(agent.as_ref(), environments.as_ref(), &deployment, timeout).await {
            tracing::warn!(
                environment = %environment.name,
                deployment_id = %deployment.id,
                error = %e,
                "Expired deployment not deleted"
            );
        }
    }
    Ok(())
}

/// Namespace first, then the record. Missing pieces count as already deleted.
async fn reap_deployment(
    agent: &dyn ClusterAgent,
    environments: &dyn EnvironmentRepository,
    deployment: &Deployment,
    timeout: Duration,
) -> Result<(), JobError> {
    if with_deadline("namespace exists", timeout, agent.namespace_exists(&deployment.namespace)).await? {
        with_deadline("delete namespace", timeout, async {
            match agent.delete_namespace(&deployment.namespace).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        })
        .await?;
        tracing::info!(namespace = %deployment.namespace, "Preview namespace deleted");
    }

    with_deadline("delete deployment", timeout, async {
        match environments.delete_deployment(deployment.id).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    })
    .await
}
