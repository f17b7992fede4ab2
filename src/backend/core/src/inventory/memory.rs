//! In-process collaborators backed by `parking_lot` locks.
//!
//! Used by the test suites, the benchmarks and local runs of the worker
//! binary. Every store records what was deleted so sweeps can be checked for
//! idempotence, and failures can be injected per cluster.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{
    Cluster, ClusterAgent, ClusterAgentFactory, ClusterFilter, ClusterRepository, Deployment,
    Environment, EnvironmentRepository, InventoryError, InventoryResult, Page, PolicyEngine,
    PolicyFinding, Recommendation, RecommendationRepository, Release, Revision,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Clusters
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MemoryClusterRepository {
    clusters: RwLock<Vec<Cluster>>,
    pages_served: RwLock<Vec<Page>>,
    fail_listing: AtomicBool,
}

impl MemoryClusterRepository {
    pub fn new(clusters: impl IntoIterator<Item = Cluster>) -> Self {
        let mut clusters: Vec<Cluster> = clusters.into_iter().collect();
        clusters.sort_by_key(|c| c.id);
        Self {
            clusters: RwLock::new(clusters),
            ..Default::default()
        }
    }

    pub fn insert(&self, cluster: Cluster) {
        let mut clusters = self.clusters.write();
        clusters.push(cluster);
        clusters.sort_by_key(|c| c.id);
    }

    /// Pages requested so far, in request order.
    pub fn pages_served(&self) -> Vec<Page> {
        self.pages_served.read().clone()
    }

    /// Make every subsequent `list` fail.
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterRepository for MemoryClusterRepository {
    async fn count(&self, filter: &ClusterFilter) -> InventoryResult<usize> {
        Ok(self.clusters.read().iter().filter(|c| filter.matches(c)).count())
    }

    async fn list(&self, filter: &ClusterFilter, page: Page) -> InventoryResult<Vec<Cluster>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(InventoryError::Backend("cluster listing unavailable".into()));
        }
        self.pages_served.write().push(page);
        Ok(self
            .clusters
            .read()
            .iter()
            .filter(|c| filter.matches(c))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cluster Agents
// ═══════════════════════════════════════════════════════════════════════════════

/// Concurrency probe shared by every agent of a factory.
#[derive(Debug, Default)]
pub struct CallProbe {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl CallProbe {
    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous `namespaces` calls observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Hands out one [`MemoryClusterAgent`] per cluster id.
#[derive(Debug, Default)]
pub struct MemoryClusterAgentFactory {
    agents: RwLock<HashMap<Uuid, Arc<MemoryClusterAgent>>>,
    unreachable: RwLock<HashSet<Uuid>>,
    probe: Arc<CallProbe>,
    latency: Option<Duration>,
}

impl MemoryClusterAgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `namespaces` call sleeps for `latency` first.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    /// The agent for `cluster_id`, created empty on first use.
    pub fn agent(&self, cluster_id: Uuid) -> Arc<MemoryClusterAgent> {
        if let Some(agent) = self.agents.read().get(&cluster_id) {
            return agent.clone();
        }
        self.agents
            .write()
            .entry(cluster_id)
            .or_insert_with(|| {
                Arc::new(MemoryClusterAgent {
                    probe: self.probe.clone(),
                    latency: self.latency,
                    ..Default::default()
                })
            })
            .clone()
    }

    pub fn set_unreachable(&self, cluster_id: Uuid) {
        self.unreachable.write().insert(cluster_id);
    }

    pub fn probe(&self) -> Arc<CallProbe> {
        self.probe.clone()
    }
}

#[async_trait]
impl ClusterAgentFactory for MemoryClusterAgentFactory {
    async fn connect(&self, cluster: &Cluster) -> InventoryResult<Arc<dyn ClusterAgent>> {
        if self.unreachable.read().contains(&cluster.id) {
            return Err(InventoryError::Unreachable(cluster.name.clone()));
        }
        Ok(self.agent(cluster.id))
    }
}

type ReleaseKey = (String, String);

/// One cluster's namespaces and Helm histories.
#[derive(Debug, Default)]
pub struct MemoryClusterAgent {
    namespaces: RwLock<BTreeSet<String>>,
    histories: RwLock<BTreeMap<ReleaseKey, Vec<Revision>>>,
    deleted_revisions: RwLock<Vec<(Release, u64)>>,
    deleted_namespaces: RwLock<Vec<String>>,
    hung: AtomicBool,
    probe: Arc<CallProbe>,
    latency: Option<Duration>,
}

impl MemoryClusterAgent {
    pub fn add_namespace(&self, namespace: impl Into<String>) {
        self.namespaces.write().insert(namespace.into());
    }

    /// Install a release with revisions `1..=revisions`, one minute apart.
    pub fn add_release(&self, namespace: &str, name: &str, revisions: u64) {
        self.add_namespace(namespace);
        let base = Utc::now() - chrono::Duration::minutes(revisions as i64);
        let history = (1..=revisions)
            .map(|number| Revision {
                number,
                updated_at: base + chrono::Duration::minutes(number as i64),
            })
            .collect();
        self.histories
            .write()
            .insert((namespace.to_string(), name.to_string()), history);
    }

    /// Remaining revision numbers of a release, ascending.
    pub fn revisions(&self, namespace: &str, name: &str) -> Vec<u64> {
        let mut numbers: Vec<u64> = self
            .histories
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .map(|h| h.iter().map(|r| r.number).collect())
            .unwrap_or_default();
        numbers.sort_unstable();
        numbers
    }

    pub fn deleted_revisions(&self) -> Vec<(Release, u64)> {
        self.deleted_revisions.read().clone()
    }

    pub fn deleted_namespaces(&self) -> Vec<String> {
        self.deleted_namespaces.read().clone()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.read().contains(namespace)
    }

    /// Make `namespaces` block until cancelled by a deadline.
    pub fn hang(&self) {
        self.hung.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterAgent for MemoryClusterAgent {
    async fn namespaces(&self) -> InventoryResult<Vec<String>> {
        self.probe.enter();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.hung.load(Ordering::SeqCst) {
            // Leaves the probe entered; the caller's deadline drops this future.
            std::future::pending::<()>().await;
        }
        self.probe.leave();
        Ok(self.namespaces.read().iter().cloned().collect())
    }

    async fn releases(&self, namespace: &str) -> InventoryResult<Vec<Release>> {
        Ok(self
            .histories
            .read()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(ns, name)| Release {
                name: name.clone(),
                namespace: ns.clone(),
            })
            .collect())
    }

    async fn release_history(&self, release: &Release) -> InventoryResult<Vec<Revision>> {
        self.histories
            .read()
            .get(&(release.namespace.clone(), release.name.clone()))
            .cloned()
            .ok_or_else(|| InventoryError::NotFound(format!("release {}", release.name)))
    }

    async fn delete_revision(&self, release: &Release, revision: u64) -> InventoryResult<()> {
        let mut histories = self.histories.write();
        let history = histories
            .get_mut(&(release.namespace.clone(), release.name.clone()))
            .ok_or_else(|| InventoryError::NotFound(format!("release {}", release.name)))?;
        let before = history.len();
        history.retain(|r| r.number != revision);
        if history.len() == before {
            return Err(InventoryError::NotFound(format!(
                "revision {} of {}",
                revision, release.name
            )));
        }
        self.deleted_revisions.write().push((release.clone(), revision));
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> InventoryResult<bool> {
        Ok(self.has_namespace(namespace))
    }

    async fn delete_namespace(&self, namespace: &str) -> InventoryResult<()> {
        if !self.namespaces.write().remove(namespace) {
            return Err(InventoryError::NotFound(format!("namespace {}", namespace)));
        }
        self.histories.write().retain(|(ns, _), _| ns != namespace);
        self.deleted_namespaces.write().push(namespace.to_string());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Environments
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MemoryEnvironmentRepository {
    environments: RwLock<Vec<Environment>>,
    deployments: RwLock<Vec<Deployment>>,
    deleted: RwLock<Vec<Uuid>>,
}

impl MemoryEnvironmentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_environment(&self, cluster_id: Uuid, name: impl Into<String>) -> Environment {
        let environment = Environment {
            id: Uuid::new_v4(),
            cluster_id,
            name: name.into(),
        };
        self.environments.write().push(environment.clone());
        environment
    }

    pub fn add_deployment(
        &self,
        environment_id: Uuid,
        namespace: impl Into<String>,
        last_updated: DateTime<Utc>,
    ) -> Deployment {
        let deployment = Deployment {
            id: Uuid::new_v4(),
            environment_id,
            namespace: namespace.into(),
            last_updated,
        };
        self.deployments.write().push(deployment.clone());
        deployment
    }

    pub fn deployment_ids(&self) -> Vec<Uuid> {
        self.deployments.read().iter().map(|d| d.id).collect()
    }

    pub fn deleted_deployments(&self) -> Vec<Uuid> {
        self.deleted.read().clone()
    }
}

#[async_trait]
impl EnvironmentRepository for MemoryEnvironmentRepository {
    async fn environments(&self, cluster_id: Uuid) -> InventoryResult<Vec<Environment>> {
        Ok(self
            .environments
            .read()
            .iter()
            .filter(|e| e.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn deployments(&self, environment_id: Uuid) -> InventoryResult<Vec<Deployment>> {
        Ok(self
            .deployments
            .read()
            .iter()
            .filter(|d| d.environment_id == environment_id)
            .cloned()
            .collect())
    }

    async fn delete_deployment(&self, deployment_id: Uuid) -> InventoryResult<()> {
        let mut deployments = self.deployments.write();
        let before = deployments.len();
        deployments.retain(|d| d.id != deployment_id);
        if deployments.len() == before {
            return Err(InventoryError::NotFound(format!("deployment {}", deployment_id)));
        }
        self.deleted.write().push(deployment_id);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Recommendations
// ═══════════════════════════════════════════════════════════════════════════════

/// Returns whatever findings were configured for a cluster.
#[derive(Debug, Default)]
pub struct StaticPolicyEngine {
    findings: RwLock<HashMap<Uuid, Vec<PolicyFinding>>>,
    evaluated: RwLock<Vec<Uuid>>,
}

impl StaticPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_findings(&self, cluster_id: Uuid, findings: Vec<PolicyFinding>) {
        self.findings.write().insert(cluster_id, findings);
    }

    /// Cluster ids evaluated so far, in call order.
    pub fn evaluated(&self) -> Vec<Uuid> {
        self.evaluated.read().clone()
    }
}

#[async_trait]
impl PolicyEngine for StaticPolicyEngine {
    async fn evaluate(&self, cluster: &Cluster) -> InventoryResult<Vec<PolicyFinding>> {
        self.evaluated.write().push(cluster.id);
        Ok(self
            .findings
            .read()
            .get(&cluster.id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecommendationRepository {
    records: RwLock<HashMap<(Uuid, Uuid, String), Recommendation>>,
}

impl MemoryRecommendationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, recommendation: Recommendation) {
        self.records.write().insert(recommendation.key(), recommendation);
    }

    /// All records of a cluster sorted by object.
    pub fn for_cluster(&self, cluster_id: Uuid) -> Vec<Recommendation> {
        let mut records: Vec<Recommendation> = self
            .records
            .read()
            .values()
            .filter(|r| r.cluster_id == cluster_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.object.cmp(&b.object));
        records
    }
}

#[async_trait]
impl RecommendationRepository for MemoryRecommendationRepository {
    async fn upsert(&self, recommendation: Recommendation) -> InventoryResult<()> {
        self.insert(recommendation);
        Ok(())
    }

    async fn archive_stale(&self, cluster_id: Uuid, run_id: Uuid, at: DateTime<Utc>) -> InventoryResult<usize> {
        let mut archived = 0;
        for record in self.records.write().values_mut() {
            if record.cluster_id == cluster_id && record.run_id != run_id && record.archived_at.is_none() {
                record.archived_at = Some(at);
                archived += 1;
            }
        }
        Ok(archived)
    }

    async fn delete_archived_before(&self, cluster_id: Uuid, cutoff: DateTime<Utc>) -> InventoryResult<usize> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| {
            !(r.cluster_id == cluster_id && r.archived_at.is_some_and(|at| at < cutoff))
        });
        Ok(before - records.len())
    }
}
