//! Collaborator interfaces consumed by the built-in jobs.
//!
//! The worker service never talks to Kubernetes, Helm or a database directly.
//! Jobs are written against these traits; production adapters live outside
//! this crate and [`memory`] provides in-process implementations.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::job::{JobError, JobErrorKind};

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure reported by a collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("cluster {0} is unreachable")]
    Unreachable(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl InventoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type InventoryResult<T> = std::result::Result<T, InventoryError>;

impl From<InventoryError> for JobError {
    fn from(error: InventoryError) -> Self {
        let code = match &error {
            InventoryError::NotFound(_) => "NOT_FOUND",
            InventoryError::Unreachable(_) => "CLUSTER_UNREACHABLE",
            InventoryError::Backend(_) => "BACKEND",
        };
        JobError::new(JobErrorKind::Infrastructure, error.to_string()).with_code(code)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Models
// ═══════════════════════════════════════════════════════════════════════════════

/// A managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    /// Whether preview environments may be created on this cluster
    pub preview_environments: bool,
}

impl Cluster {
    pub fn new(project_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            preview_environments: false,
        }
    }

    pub fn with_preview_environments(mut self) -> Self {
        self.preview_environments = true;
        self
    }
}

/// Which clusters a sweep covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ClusterFilter {
    #[default]
    All,
    PreviewEnvironmentsEnabled,
    /// Clusters matching both lists; an empty list matches everything.
    Selection {
        project_ids: Vec<Uuid>,
        cluster_ids: Vec<Uuid>,
    },
}

impl ClusterFilter {
    pub fn matches(&self, cluster: &Cluster) -> bool {
        match self {
            Self::All => true,
            Self::PreviewEnvironmentsEnabled => cluster.preview_environments,
            Self::Selection {
                project_ids,
                cluster_ids,
            } => {
                (project_ids.is_empty() || project_ids.contains(&cluster.project_id))
                    && (cluster_ids.is_empty() || cluster_ids.contains(&cluster.id))
            }
        }
    }
}

/// A window over an ordered listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Page {
    pub index: usize,
    pub offset: usize,
    pub limit: usize,
}

/// A Helm release installed in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
}

/// One entry of a release's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub number: u64,
    pub updated_at: DateTime<Utc>,
}

/// A preview environment hosted on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
}

/// A deployment record backing a preview environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub namespace: String,
    pub last_updated: DateTime<Utc>,
}

/// Raw output of the policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFinding {
    /// Kubernetes object reference, e.g. `deployment/api`
    pub object: String,
    pub policy: String,
    pub severity: String,
    pub message: String,
}

/// A stored recommendation, unique per (project, cluster, object).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub project_id: Uuid,
    pub cluster_id: Uuid,
    pub object: String,
    pub policy: String,
    pub severity: String,
    pub message: String,
    pub run_id: Uuid,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Recommendation {
    pub fn from_finding(cluster: &Cluster, run_id: Uuid, finding: PolicyFinding, now: DateTime<Utc>) -> Self {
        Self {
            project_id: cluster.project_id,
            cluster_id: cluster.id,
            object: finding.object,
            policy: finding.policy,
            severity: finding.severity,
            message: finding.message,
            run_id,
            updated_at: now,
            archived_at: None,
        }
    }

    pub fn key(&self) -> (Uuid, Uuid, String) {
        (self.project_id, self.cluster_id, self.object.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Interfaces
// ═══════════════════════════════════════════════════════════════════════════════

/// Cluster inventory. Listings are ordered by cluster id.
#[async_trait]
pub trait ClusterRepository: Send + Sync {
    async fn count(&self, filter: &ClusterFilter) -> InventoryResult<usize>;

    async fn list(&self, filter: &ClusterFilter, page: Page) -> InventoryResult<Vec<Cluster>>;
}

/// Opens a connection to one cluster.
#[async_trait]
pub trait ClusterAgentFactory: Send + Sync {
    async fn connect(&self, cluster: &Cluster) -> InventoryResult<Arc<dyn ClusterAgent>>;
}

/// Operations against a single cluster.
#[async_trait]
pub trait ClusterAgent: Send + Sync {
    async fn namespaces(&self) -> InventoryResult<Vec<String>>;

    async fn releases(&self, namespace: &str) -> InventoryResult<Vec<Release>>;

    /// History of a release in no particular order.
    async fn release_history(&self, release: &Release) -> InventoryResult<Vec<Revision>>;

    async fn delete_revision(&self, release: &Release, revision: u64) -> InventoryResult<()>;

    async fn namespace_exists(&self, namespace: &str) -> InventoryResult<bool>;

    async fn delete_namespace(&self, namespace: &str) -> InventoryResult<()>;
}

/// Preview environments and their deployment records.
#[async_trait]
pub trait EnvironmentRepository: Send + Sync {
    async fn environments(&self, cluster_id: Uuid) -> InventoryResult<Vec<Environment>>;

    async fn deployments(&self, environment_id: Uuid) -> InventoryResult<Vec<Deployment>>;

    async fn delete_deployment(&self, deployment_id: Uuid) -> InventoryResult<()>;
}

/// Opaque rule engine evaluated per cluster.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, cluster: &Cluster) -> InventoryResult<Vec<PolicyFinding>>;
}

/// Recommendation storage.
#[async_trait]
pub trait RecommendationRepository: Send + Sync {
    /// Insert or replace the record with the same (project, cluster, object).
    async fn upsert(&self, recommendation: Recommendation) -> InventoryResult<()>;

    /// Archive the cluster's live records whose run id differs from `run_id`.
    async fn archive_stale(&self, cluster_id: Uuid, run_id: Uuid, at: DateTime<Utc>) -> InventoryResult<usize>;

    /// Delete the cluster's records archived before `cutoff`.
    async fn delete_archived_before(&self, cluster_id: Uuid, cutoff: DateTime<Utc>) -> InventoryResult<usize>;
}
