//! Policy recommender.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{SweepOptions, RECOMMENDER_KIND};
use crate::inventory::{
    Cluster, ClusterFilter, ClusterRepository, PolicyEngine, Recommendation,
    RecommendationRepository,
};
use crate::jobs::job::{with_deadline, Job, JobError, JobResult};
use crate::jobs::paging::PagedSweep;

/// Submission body of a recommender job. Empty lists select every cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommenderPayload {
    #[serde(default)]
    pub project_ids: Vec<Uuid>,
    #[serde(default)]
    pub cluster_ids: Vec<Uuid>,
}

impl RecommenderPayload {
    fn filter(&self) -> ClusterFilter {
        if self.project_ids.is_empty() && self.cluster_ids.is_empty() {
            ClusterFilter::All
        } else {
            ClusterFilter::Selection {
                project_ids: self.project_ids.clone(),
                cluster_ids: self.cluster_ids.clone(),
            }
        }
    }
}

/// Evaluates policies per cluster and keeps the recommendation store in
/// step with the latest run.
pub struct Recommender {
    enqueued_at: DateTime<Utc>,
    retention: Duration,
    options: SweepOptions,
    payload: RecommenderPayload,
    clusters: Arc<dyn ClusterRepository>,
    policies: Arc<dyn PolicyEngine>,
    recommendations: Arc<dyn RecommendationRepository>,
}

impl Recommender {
    pub fn new(
        enqueued_at: DateTime<Utc>,
        retention: Duration,
        options: SweepOptions,
        clusters: Arc<dyn ClusterRepository>,
        policies: Arc<dyn PolicyEngine>,
        recommendations: Arc<dyn RecommendationRepository>,
    ) -> Self {
        Self {
            enqueued_at,
            retention,
            options,
            payload: RecommenderPayload::default(),
            clusters,
            policies,
            recommendations,
        }
    }

    pub fn payload(&self) -> &RecommenderPayload {
        &self.payload
    }
}

#[async_trait]
impl Job for Recommender {
    fn identifier(&self) -> &str {
        RECOMMENDER_KIND
    }

    fn enqueue_time(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    fn set_payload(&mut self, payload: &[u8]) -> JobResult {
        self.payload = serde_json::from_slice(payload)?;
        Ok(())
    }

    async fn run(&mut self) -> JobResult {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| JobError::configuration(format!("archive retention out of range: {}", e)))?;
        let timeout = self.options.call_timeout;
        let filter = self.payload.filter();

        let total = with_deadline("count clusters", timeout, self.clusters.count(&filter)).await?;
        tracing::info!(job = RECOMMENDER_KIND, clusters = total, "Running recommender");

        let clusters = self.clusters.clone();
        let policies = self.policies.clone();
        let recommendations = self.recommendations.clone();
        let report = PagedSweep::new(RECOMMENDER_KIND, self.options.page_size)
            .run(
                total,
                |page| {
                    let clusters = clusters.clone();
                    let filter = filter.clone();
                    async move { with_deadline("list clusters", timeout, clusters.list(&filter, page)).await }
                },
                |cluster: Cluster| {
                    recommend(policies.clone(), recommendations.clone(), cluster, retention, timeout)
                },
            )
            .await?;

        tracing::info!(job = RECOMMENDER_KIND, report = ?report, "Recommender finished");
        Ok(())
    }
}

async fn recommend(
    policies: Arc<dyn PolicyEngine>,
    recommendations: Arc<dyn RecommendationRepository>,
    cluster: Cluster,
    retention: chrono::Duration,
    timeout: Duration,
) -> Result<(), JobError> {
    let run_id = Uuid::new_v4();
    let findings = with_deadline("evaluate policies", timeout, policies.evaluate(&cluster)).await?;

    let now = Utc::now();
    let found = findings.len();
    for finding in findings {
        let recommendation = Recommendation::from_finding(&cluster, run_id, finding, now);
        with_deadline("upsert recommendation", timeout, recommendations.upsert(recommendation)).await?;
    }

    let archived = with_deadline(
        "archive recommendations",
        timeout,
        recommendations.archive_stale(cluster.id, run_id, now),
    )
    .await?;
    let purged = with_deadline(
        "purge recommendations",
        timeout,
        recommendations.delete_archived_before(cluster.id, now - retention),
    )
    .await?;

    tracing::debug!(
        cluster = %cluster.name,
        run_id = %run_id,
        found,
        archived,
        purged,
        "Recommendations refreshed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::memory::{
        MemoryClusterRepository, MemoryRecommendationRepository, StaticPolicyEngine,
    };
    use crate::inventory::PolicyFinding;
    use crate::jobs::job::JobErrorKind;

    fn finding(object: &str) -> PolicyFinding {
        PolicyFinding {
            object: object.into(),
            policy: "require-limits".into(),
            severity: "warning".into(),
            message: "container has no memory limit".into(),
        }
    }

    fn job(
        clusters: Vec<Cluster>,
        policies: Arc<StaticPolicyEngine>,
        store: Arc<MemoryRecommendationRepository>,
    ) -> Recommender {
        Recommender::new(
            Utc::now(),
            Duration::from_secs(30 * 24 * 3600),
            SweepOptions {
                page_size: 10,
                call_timeout: Duration::from_secs(10),
            },
            Arc::new(MemoryClusterRepository::new(clusters)),
            policies,
            store,
        )
    }

    #[test]
    fn test_payload_parsing() {
        let mut recommender = job(
            vec![],
            Arc::new(StaticPolicyEngine::new()),
            Arc::new(MemoryRecommendationRepository::new()),
        );
        let cluster = Uuid::new_v4();
        recommender
            .set_payload(format!(r#"{{"cluster_ids": ["{}"]}}"#, cluster).as_bytes())
            .unwrap();
        assert_eq!(recommender.payload().cluster_ids, vec![cluster]);
        assert!(recommender.payload().project_ids.is_empty());

        let err = recommender.set_payload(b"{not json").unwrap_err();
        assert_eq!(err.kind, JobErrorKind::InvalidPayload);
    }

    #[tokio::test]
    async fn test_second_run_archives_resolved_findings() {
        let cluster = Cluster::new(Uuid::new_v4(), "prod");
        let policies = Arc::new(StaticPolicyEngine::new());
        let store = Arc::new(MemoryRecommendationRepository::new());

        policies.set_findings(cluster.id, vec![finding("deployment/api"), finding("deployment/web")]);
        job(vec![cluster.clone()], policies.clone(), store.clone()).run().await.unwrap();
        assert_eq!(store.for_cluster(cluster.id).len(), 2);

        policies.set_findings(cluster.id, vec![finding("deployment/api")]);
        job(vec![cluster.clone()], policies.clone(), store.clone()).run().await.unwrap();

        let records = store.for_cluster(cluster.id);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].object, "deployment/api");
        assert!(records[0].archived_at.is_none());
        assert_eq!(records[1].object, "deployment/web");
        assert!(records[1].archived_at.is_some());
    }
}
