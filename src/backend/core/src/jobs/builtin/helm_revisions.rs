//! Helm revision retention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::{SweepOptions, HELM_REVISIONS_KIND};
use crate::inventory::{Cluster, ClusterAgent, ClusterAgentFactory, ClusterFilter, ClusterRepository, Release};
use crate::jobs::job::{with_deadline, Job, JobError, JobResult};
use crate::jobs::paging::PagedSweep;

/// Trims every release history on every cluster down to the newest
/// `threshold` revisions.
pub struct HelmRevisionsCountTracker {
    enqueued_at: DateTime<Utc>,
    threshold: usize,
    options: SweepOptions,
    clusters: Arc<dyn ClusterRepository>,
    agents: Arc<dyn ClusterAgentFactory>,
}

impl HelmRevisionsCountTracker {
    pub fn new(
        enqueued_at: DateTime<Utc>,
        threshold: usize,
        options: SweepOptions,
        clusters: Arc<dyn ClusterRepository>,
        agents: Arc<dyn ClusterAgentFactory>,
    ) -> Self {
        Self {
            enqueued_at,
            threshold,
            options,
            clusters,
            agents,
        }
    }
}

#[async_trait]
impl Job for HelmRevisionsCountTracker {
    fn identifier(&self) -> &str {
        HELM_REVISIONS_KIND
    }

    fn enqueue_time(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    async fn run(&mut self) -> JobResult {
        let timeout = self.options.call_timeout;
        let threshold = self.threshold;
        let filter = ClusterFilter::All;

        let total = with_deadline("count clusters", timeout, self.clusters.count(&filter)).await?;
        tracing::info!(job = HELM_REVISIONS_KIND, clusters = total, threshold, "Sweeping Helm histories");

        let clusters = self.clusters.clone();
        let agents = self.agents.clone();
        let report = PagedSweep::new(HELM_REVISIONS_KIND, self.options.page_size)
            .run(
                total,
                |page| {
                    let clusters = clusters.clone();
                    let filter = filter.clone();
                    async move { with_deadline("list clusters", timeout, clusters.list(&filter, page)).await }
                },
                |cluster: Cluster| prune_cluster(agents.clone(), cluster, threshold, timeout),
            )
            .await?;

        tracing::info!(job = HELM_REVISIONS_KIND, report = ?report, "Helm history sweep finished");
        Ok(())
    }
}

async fn prune_cluster(
    agents: Arc<dyn ClusterAgentFactory>,
    cluster: Cluster,
    threshold: usize,
    timeout: Duration,
) -> Result<(), JobError> {
    let agent = with_deadline("connect", timeout, agents.connect(&cluster)).await?;
    let namespaces = with_deadline("list namespaces", timeout, agent.namespaces()).await?;

    let mut deleted = 0;
    for namespace in namespaces {
        let releases = match with_deadline("list releases", timeout, agent.releases(&namespace)).await {
            Ok(releases) => releases,
            Err(e) => {
                tracing::warn!(cluster = %cluster.name, namespace = %namespace, error = %e, "Skipping namespace");
                continue;
            }
        };

        for release in releases {
            match prune_release(agent.as_ref(), &release, threshold, timeout).await {
                Ok(count) => deleted += count,
                Err(e) => tracing::warn!(
                    cluster = %cluster.name,
                    release = %release.name,
                    namespace = %release.namespace,
                    error = %e,
                    "Release history not trimmed"
                ),
            }
        }
    }

    tracing::debug!(cluster = %cluster.name, deleted, "Cluster Helm histories trimmed");
    Ok(())
}

/// Delete every revision beyond the newest `threshold`. Returns how many went.
async fn prune_release(
    agent: &dyn ClusterAgent,
    release: &Release,
    threshold: usize,
    timeout: Duration,
) -> Result<usize, JobError> {
    let mut history = with_deadline("release history", timeout, agent.release_history(release)).await?;
    if history.len() <= threshold {
        return Ok(0);
    }

    history.sort_by(|a, b| b.number.cmp(&a.number));

    let mut deleted = 0;
    for revision in &history[threshold..] {
        match with_deadline("delete revision", timeout, async {
            match agent.delete_revision(release, revision.number).await {
                Err(e) if e.is_not_found() => Ok(false),
                other => other.map(|()| true),
            }
        })
        .await
        {
            Ok(true) => deleted += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(
                release = %release.name,
                revision = revision.number,
                error = %e,
                "Revision not deleted"
            ),
        }
    }
    Ok(deleted)
}
