//! Integration tests for paged sweeps and the built-in jobs.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidepool_core::config::JobsConfig;
use tidepool_core::inventory::memory::{
    MemoryClusterAgentFactory, MemoryClusterRepository, MemoryEnvironmentRepository,
    MemoryRecommendationRepository, StaticPolicyEngine,
};
use tidepool_core::inventory::{Cluster, Page, PolicyFinding};
use tidepool_core::jobs::builtin::{
    HELM_REVISIONS_KIND, PREVIEW_TTL_KIND, RECOMMENDER_KIND,
};
use tidepool_core::jobs::{
    register_builtin, Collaborators, Dispatcher, JobError, JobErrorKind, JobRegistry, PagedSweep,
    SubmissionQueue,
};
use uuid::Uuid;

// ============================================================================
// Paged Sweep
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sweep_of_250_items_uses_three_drained_pages() {
    let completed = Arc::new(AtomicUsize::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let fetched = Arc::new(Mutex::new(Vec::<(Page, usize)>::new()));

    let sweep = PagedSweep::new("s4", 100);
    let report = sweep
        .run(
            250,
            |page: Page| {
                // Completed count at fetch time proves the previous page drained.
                fetched.lock().push((page, completed.load(Ordering::SeqCst)));
                let end = (page.offset + page.limit).min(250);
                async move { Ok::<_, JobError>((page.offset..end).collect::<Vec<usize>>()) }
            },
            |_item: usize| {
                let completed = completed.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(report.pages, 3);
    assert_eq!(report.items, 250);
    assert_eq!(report.succeeded, 250);
    assert_eq!(completed.load(Ordering::SeqCst), 250);

    let fetched = fetched.lock().clone();
    let offsets: Vec<usize> = fetched.iter().map(|(page, _)| page.offset).collect();
    assert_eq!(offsets, vec![0, 100, 200]);
    let drained: Vec<usize> = fetched.iter().map(|(_, done)| *done).collect();
    assert_eq!(drained, vec![0, 100, 200]);

    // Every item of a page sleeps together, and never more than a page.
    assert_eq!(peak.load(Ordering::SeqCst), 100);
}

#[tokio::test(start_paused = true)]
async fn test_helm_sweep_over_250_clusters_is_bounded_by_page_size() {
    let project = Uuid::new_v4();
    let clusters: Vec<Cluster> = (0..250).map(|i| Cluster::new(project, format!("c{:03}", i))).collect();
    let repo = Arc::new(MemoryClusterRepository::new(clusters.clone()));
    let agents = Arc::new(MemoryClusterAgentFactory::with_latency(Duration::from_millis(50)));
    for cluster in &clusters {
        agents.agent(cluster.id).add_release("apps", "api", 3);
    }

    let collaborators = Collaborators {
        clusters: repo.clone(),
        agents: agents.clone(),
        ..Collaborators::in_memory()
    };
    let config = JobsConfig {
        helm_revisions_threshold: 2,
        sweep_page_size: 100,
        ..JobsConfig::default()
    };
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, collaborators, &config).unwrap();

    let mut job = registry.build(HELM_REVISIONS_KIND, None).unwrap();
    job.run().await.unwrap();

    let pages = repo.pages_served();
    assert_eq!(pages.len(), 3);
    assert_eq!(pages.iter().map(|p| p.offset).collect::<Vec<_>>(), vec![0, 100, 200]);

    let probe = agents.probe();
    assert_eq!(probe.calls(), 250);
    assert!(probe.peak() <= 100, "peak {}", probe.peak());

    for cluster in &clusters {
        assert_eq!(agents.agent(cluster.id).revisions("apps", "api"), vec![2, 3]);
    }
}

#[tokio::test]
async fn test_cluster_listing_failure_fails_job() {
    let repo = Arc::new(MemoryClusterRepository::new([Cluster::new(Uuid::new_v4(), "c")]));
    repo.fail_listing(true);

    let collaborators = Collaborators {
        clusters: repo,
        ..Collaborators::in_memory()
    };
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, collaborators, &JobsConfig::default()).unwrap();

    let err = registry.build(HELM_REVISIONS_KIND, None).unwrap().run().await.unwrap_err();
    assert_eq!(err.kind, JobErrorKind::Infrastructure);
}

#[tokio::test(start_paused = true)]
async fn test_hung_cluster_hits_deadline_without_blocking_sweep() {
    let project = Uuid::new_v4();
    let stuck = Cluster::new(project, "stuck");
    let fine = Cluster::new(project, "fine");
    let agents = Arc::new(MemoryClusterAgentFactory::new());
    agents.agent(stuck.id).hang();
    agents.agent(fine.id).add_release("apps", "api", 4);

    let collaborators = Collaborators {
        clusters: Arc::new(MemoryClusterRepository::new([stuck, fine.clone()])),
        agents: agents.clone(),
        ..Collaborators::in_memory()
    };
    let config = JobsConfig {
        helm_revisions_threshold: 1,
        external_call_timeout: Duration::from_secs(2),
        ..JobsConfig::default()
    };
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, collaborators, &config).unwrap();

    registry.build(HELM_REVISIONS_KIND, None).unwrap().run().await.unwrap();
    assert_eq!(agents.agent(fine.id).revisions("apps", "api"), vec![4]);
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn test_helm_retention_second_run_deletes_nothing() {
    let cluster = Cluster::new(Uuid::new_v4(), "prod");
    let agents = Arc::new(MemoryClusterAgentFactory::new());
    let agent = agents.agent(cluster.id);
    agent.add_release("apps", "api", 120);
    agent.add_release("apps", "worker", 100);
    agent.add_release("infra", "ingress", 101);

    let collaborators = Collaborators {
        clusters: Arc::new(MemoryClusterRepository::new([cluster])),
        agents: agents.clone(),
        ..Collaborators::in_memory()
    };
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, collaborators, &JobsConfig::default()).unwrap();

    registry.build(HELM_REVISIONS_KIND, None).unwrap().run().await.unwrap();
    assert_eq!(agent.deleted_revisions().len(), 21);
    assert_eq!(agent.revisions("apps", "api"), (21..=120).collect::<Vec<u64>>());
    assert_eq!(agent.revisions("apps", "worker").len(), 100);
    assert_eq!(agent.revisions("infra", "ingress"), (2..=101).collect::<Vec<u64>>());

    registry.build(HELM_REVISIONS_KIND, None).unwrap().run().await.unwrap();
    assert_eq!(agent.deleted_revisions().len(), 21);
}

#[tokio::test]
async fn test_preview_reaper_second_run_deletes_nothing() {
    let cluster = Cluster::new(Uuid::new_v4(), "preview").with_preview_environments();
    let skipped = Cluster::new(Uuid::new_v4(), "no-previews");
    let agents = Arc::new(MemoryClusterAgentFactory::new());
    let agent = agents.agent(cluster.id);
    let environments = Arc::new(MemoryEnvironmentRepository::new());

    let old = Utc::now() - chrono::Duration::days(10);
    for i in 0..3 {
        let env = environments.add_environment(cluster.id, format!("env-{}", i));
        agent.add_namespace(format!("pr-{}", i));
        environments.add_deployment(env.id, format!("pr-{}", i), old);
    }
    let live = environments.add_environment(cluster.id, "live");
    agent.add_namespace("pr-live");
    let kept = environments.add_deployment(live.id, "pr-live", Utc::now());

    // A stale deployment on a cluster without previews is out of scope.
    let other = environments.add_environment(skipped.id, "legacy");
    let untouched = environments.add_deployment(other.id, "legacy", old);

    let collaborators = Collaborators {
        clusters: Arc::new(MemoryClusterRepository::new([cluster, skipped])),
        agents: agents.clone(),
        environments: environments.clone(),
        ..Collaborators::in_memory()
    };
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, collaborators, &JobsConfig::default()).unwrap();

    registry.build(PREVIEW_TTL_KIND, None).unwrap().run().await.unwrap();
    let mut remaining = environments.deployment_ids();
    remaining.sort();
    let mut expected = vec![kept.id, untouched.id];
    expected.sort();
    assert_eq!(remaining, expected);
    assert_eq!(agent.deleted_namespaces().len(), 3);
    assert!(agent.has_namespace("pr-live"));

    registry.build(PREVIEW_TTL_KIND, None).unwrap().run().await.unwrap();
    assert_eq!(environments.deleted_deployments().len(), 3);
    assert_eq!(agent.deleted_namespaces().len(), 3);
}

#[tokio::test]
async fn test_recommender_payload_narrows_clusters() {
    let project = Uuid::new_v4();
    let selected = Cluster::new(project, "selected");
    let ignored = Cluster::new(Uuid::new_v4(), "ignored");
    let policies = Arc::new(StaticPolicyEngine::new());
    let store = Arc::new(MemoryRecommendationRepository::new());
    for cluster in [&selected, &ignored] {
        policies.set_findings(
            cluster.id,
            vec![PolicyFinding {
                object: "deployment/api".into(),
                policy: "no-latest-tag".into(),
                severity: "high".into(),
                message: "image uses :latest".into(),
            }],
        );
    }

    let collaborators = Collaborators {
        clusters: Arc::new(MemoryClusterRepository::new([selected.clone(), ignored.clone()])),
        policies: policies.clone(),
        recommendations: store.clone(),
        ..Collaborators::in_memory()
    };
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, collaborators, &JobsConfig::default()).unwrap();

    let payload = format!(r#"{{"project_ids": ["{}"]}}"#, project);
    registry
        .build(RECOMMENDER_KIND, Some(payload.as_bytes()))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(policies.evaluated(), vec![selected.id]);
    assert_eq!(store.for_cluster(selected.id).len(), 1);
    assert!(store.for_cluster(ignored.id).is_empty());
}

#[tokio::test]
async fn test_recommender_purges_old_archived_results() {
    let cluster = Cluster::new(Uuid::new_v4(), "prod");
    let policies = Arc::new(StaticPolicyEngine::new());
    let store = Arc::new(MemoryRecommendationRepository::new());

    let ancient = Utc::now() - chrono::Duration::days(45);
    store.insert(tidepool_core::inventory::Recommendation {
        project_id: cluster.project_id,
        cluster_id: cluster.id,
        object: "deployment/removed".into(),
        policy: "require-limits".into(),
        severity: "low".into(),
        message: "gone long ago".into(),
        run_id: Uuid::new_v4(),
        updated_at: ancient,
        archived_at: Some(ancient),
    });

    let collaborators = Collaborators {
        clusters: Arc::new(MemoryClusterRepository::new([cluster.clone()])),
        policies,
        recommendations: store.clone(),
        ..Collaborators::in_memory()
    };
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, collaborators, &JobsConfig::default()).unwrap();

    registry.build(RECOMMENDER_KIND, None).unwrap().run().await.unwrap();
    assert!(store.for_cluster(cluster.id).is_empty());
}

// ============================================================================
// Through the dispatcher
// ============================================================================

#[tokio::test]
async fn test_builtin_jobs_run_on_the_pool() {
    let cluster = Cluster::new(Uuid::new_v4(), "prod");
    let agents = Arc::new(MemoryClusterAgentFactory::new());
    agents.agent(cluster.id).add_release("apps", "api", 150);

    let collaborators = Collaborators {
        clusters: Arc::new(MemoryClusterRepository::new([cluster.clone()])),
        agents: agents.clone(),
        ..Collaborators::in_memory()
    };
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, collaborators, &JobsConfig::default()).unwrap();

    let (submitter, receiver) = SubmissionQueue::bounded(4).unwrap();
    let dispatcher = Dispatcher::new(2).unwrap();
    dispatcher.run(receiver).unwrap();

    for kind in [HELM_REVISIONS_KIND, PREVIEW_TTL_KIND, RECOMMENDER_KIND] {
        registry.submit(&submitter, kind, None).await.unwrap();
    }
    while dispatcher.stats().processed < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(dispatcher.stats().succeeded, 3);
    assert_eq!(agents.agent(cluster.id).revisions("apps", "api").len(), 100);

    dispatcher.exit().await;
    assert_eq!(dispatcher.live_tasks(), 0);
}
