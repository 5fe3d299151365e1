//! Application lifecycle: rollback, pruning, removal, cancellation and
//! source outages.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use tideline::gitops::{
    ApplicationEventKind, ConditionKind, HealthStatus, ReconcileError, ResourceKey,
    ResourceStatus, SyncDecision, SyncPhase, SyncStatus,
};

#[tokio::test]
async fn test_rollback_reapplies_retained_snapshot() {
    let h = TestHarness::new();
    let v1 = h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").manual().build());
    h.sync("web").await;

    let v2 = h.push(&[&ChartBuilder::standard("web", "bonjour")]).await;
    let synced = h.sync("web").await;
    assert_eq!(synced.revision, v2);
    assert_eq!(h.reconciler.revisions("web").unwrap(), vec![v1.clone(), v2.clone()]);

    let rolled_back = h.reconciler.rollback("web", &v1).await.unwrap();
    assert_eq!(rolled_back.revision, v1);
    assert_eq!(rolled_back.phase, SyncPhase::Synced);
    assert_eq!(
        h.live_field("ConfigMap", "prod", "web-config", "/data/greeting"),
        Some(json!("hello"))
    );
    assert_eq!(h.status("web").last_revision, Some(v1));
    assert_eq!(h.status("web").observed_revision, Some(v2.clone()));

    // The source head still points at v2.
    let refreshed = h.refresh("web").await;
    assert_eq!(refreshed.revision, v2);
    assert_eq!(refreshed.decision, SyncDecision::ReportOnly);
    assert_eq!(refreshed.phase, SyncPhase::OutOfSync);
}

#[tokio::test]
async fn test_rollback_to_unknown_revision_fails() {
    let h = TestHarness::new();
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").manual().build());
    h.sync("web").await;

    let writes = h.cluster.write_count();
    let err = h
        .reconciler
        .rollback("web", &tideline::gitops::RevisionId::new("0000000"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::RevisionNotFound { .. }));
    assert_eq!(h.cluster.write_count(), writes);
}

#[tokio::test]
async fn test_orphans_are_reported_without_prune() {
    let h = TestHarness::new();
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").automatic().prune(false).build());
    h.refresh("web").await;

    h.push(&[&ChartBuilder::standard("web", "hello").without("service.yaml")])
        .await;
    let outcome = h.refresh("web").await;

    assert_eq!(outcome.diff.orphans, vec![ResourceKey::new("Service", "prod", "web")]);
    assert_eq!(outcome.phase, SyncPhase::OutOfSync);
    assert!(h.live("Service", "prod", "web").is_some());
    let status = h.status("web");
    let condition = status.condition(ConditionKind::OrphanedResources).unwrap();
    assert!(condition.message.contains("Service/prod/web"));
}

#[tokio::test]
async fn test_prune_deletes_undeclared_resources() {
    let h = TestHarness::new();
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").automatic().prune(true).build());
    h.refresh("web").await;

    h.push(&[&ChartBuilder::standard("web", "hello").without("service.yaml")])
        .await;
    let outcome = h.refresh("web").await;

    assert_eq!(outcome.phase, SyncPhase::Synced);
    assert!(h.live("Service", "prod", "web").is_none());
    assert_eq!(h.cluster.len(), 3);
    assert!(h.status("web").condition(ConditionKind::OrphanedResources).is_none());
}

#[tokio::test]
async fn test_unowned_objects_are_never_pruned() {
    let h = TestHarness::new();
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").automatic().prune(true).build());
    h.cluster.seed(tideline::gitops::Manifest::new(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": "someone-else", "namespace": "prod"}
    })));

    h.refresh("web").await;
    assert!(h.live("ConfigMap", "prod", "someone-else").is_some());
    assert_eq!(h.cluster.len(), 5);
}

#[tokio::test]
async fn test_cascade_remove_deletes_owned_objects() {
    let h = TestHarness::new();
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").automatic().build());
    h.refresh("web").await;
    assert_eq!(h.cluster.len(), 4);

    let deleted = h.reconciler.remove("web", true).await.unwrap();
    assert_eq!(deleted.len(), 4);
    assert!(deleted.iter().all(|r| r.status == ResourceStatus::Synced));
    assert!(h.cluster.is_empty());
    assert!(matches!(
        h.reconciler.status("web"),
        Err(ReconcileError::ApplicationNotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_without_cascade_leaves_objects() {
    let h = TestHarness::new();
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").automatic().build());
    h.refresh("web").await;

    let deleted = h.reconciler.remove("web", false).await.unwrap();
    assert!(deleted.is_empty());
    assert_eq!(h.cluster.len(), 4);
    assert!(h.reconciler.applications().is_empty());
}

#[tokio::test]
async fn test_newer_revision_cancels_in_flight_sync() {
    let h = TestHarness::with_write_latency(Duration::from_millis(100));
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").manual().build());

    let reconciler = Arc::clone(&h.reconciler);
    let running = tokio::spawn(async move { reconciler.sync("web").await });

    let mut started = false;
    for _ in 0..200 {
        if h.status("web").operation.is_some() {
            started = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(started, "sync never started");

    let v2 = h.commit(&[&ChartBuilder::standard("web", "bonjour")]);
    let cancelled = h.reconciler.notify_revision(REPO, Some(&v2)).await;
    assert_eq!(cancelled, vec!["web".to_string()]);

    let outcome = running.await.unwrap().unwrap();
    let result = outcome.result.unwrap();
    assert_eq!(result.status, SyncStatus::OutOfSync);
    assert!(result.count(ResourceStatus::Skipped) >= 1);
    assert_eq!(result.count(ResourceStatus::Error), 0);
    assert_eq!(outcome.phase, SyncPhase::OutOfSync);
    assert!(h.status("web").operation.is_none());

    let next = h.sync("web").await;
    assert_eq!(next.revision, v2);
    assert_eq!(next.phase, SyncPhase::Synced);
    assert_eq!(
        h.live_field("ConfigMap", "prod", "web-config", "/data/greeting"),
        Some(json!("bonjour"))
    );
}

#[tokio::test]
async fn test_concurrent_cycles_are_serialized() {
    let h = TestHarness::with_write_latency(Duration::from_millis(10));
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").automatic().build());

    let (a, b) = tokio::join!(h.reconciler.refresh("web"), h.reconciler.refresh("web"));
    a.unwrap();
    b.unwrap();
    assert_eq!(h.cluster.write_count(), 4);
    assert_eq!(h.status("web").phase, SyncPhase::Synced);
}

#[tokio::test]
async fn test_source_outage_marks_health_unknown() {
    let h = TestHarness::new();
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").automatic().build());
    h.refresh("web").await;
    let writes = h.cluster.write_count();

    h.source.set_unavailable(REPO, true);
    let err = h.reconciler.refresh("web").await.unwrap_err();
    assert_eq!(err.reason(), "SourceUnavailable");
    let status = h.status("web");
    assert_eq!(status.consecutive_source_failures, 1);
    assert_eq!(status.health, HealthStatus::Healthy);

    h.reconciler.refresh("web").await.unwrap_err();
    let status = h.status("web");
    assert_eq!(status.health, HealthStatus::Unknown);
    assert!(status.condition(ConditionKind::SourceUnavailable).is_some());
    assert_eq!(h.cluster.write_count(), writes);

    h.source.set_unavailable(REPO, false);
    let recovered = h.refresh("web").await;
    assert_eq!(recovered.health, HealthStatus::Healthy);
    let status = h.status("web");
    assert_eq!(status.consecutive_source_failures, 0);
    assert!(status.condition(ConditionKind::SourceUnavailable).is_none());
}

#[tokio::test]
async fn test_render_failure_keeps_live_state() {
    let h = TestHarness::new();
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").automatic().build());
    h.refresh("web").await;
    let writes = h.cluster.write_count();

    let broken = ChartBuilder::standard("web", "hello")
        .template("broken.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n");
    h.push(&[&broken]).await;
    let err = h.reconciler.refresh("web").await.unwrap_err();
    assert_eq!(err.reason(), "RenderError");
    assert_eq!(h.cluster.write_count(), writes);
    assert!(h.status("web").condition(ConditionKind::RenderError).is_some());

    h.push(&[&ChartBuilder::standard("web", "hola")]).await;
    h.refresh("web").await;
    assert!(h.status("web").condition(ConditionKind::RenderError).is_none());
    assert_eq!(
        h.live_field("ConfigMap", "prod", "web-config", "/data/greeting"),
        Some(json!("hola"))
    );
}

#[tokio::test]
async fn test_events_follow_the_cycle() {
    let h = TestHarness::new();
    let mut events = h.reconciler.subscribe();
    h.push(&[&ChartBuilder::standard("web", "hello")]).await;
    h.register(ApplicationBuilder::new("web").automatic().build());
    h.refresh("web").await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.application, "web");
        kinds.push(event.kind);
    }

    assert_eq!(kinds.first(), Some(&ApplicationEventKind::Registered));
    assert!(kinds.iter().any(|k| matches!(
        k,
        ApplicationEventKind::SyncStarted { patches: 4, .. }
    )));
    assert!(kinds.iter().any(|k| matches!(
        k,
        ApplicationEventKind::SyncCompleted {
            status: SyncStatus::Synced,
            ..
        }
    )));
    assert_eq!(
        kinds.last(),
        Some(&ApplicationEventKind::StatusChanged {
            phase: SyncPhase::Synced,
            health: HealthStatus::Healthy,
        })
    );
}
