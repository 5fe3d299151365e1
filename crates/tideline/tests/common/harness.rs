//! Test harness around an in-memory source and cluster.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use tideline::config::{EngineSettings, RetrySettings};
use tideline::gitops::{
    ApplicationResource, ApplicationStatus, MemoryCluster, MemorySource, ReconcileOutcome,
    Reconciler, ResourceKey, RevisionId, SyncTrigger,
};

use super::builders::{ChartBuilder, BRANCH, REPO};

/// Settings with millisecond backoff so retry paths stay fast.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        poll_timeout_secs: 5,
        apply_timeout_secs: 5,
        retry: RetrySettings {
            max_retries: 2,
            base_delay_ms: 1,
            ..Default::default()
        },
        unknown_after_failures: 2,
        history_limit: 5,
        max_concurrent_reconciles: 2,
        ..Default::default()
    }
}

/// Isolated engine: one reconciler, one in-memory repository, one cluster.
pub struct TestHarness {
    pub source: Arc<MemorySource>,
    pub cluster: Arc<MemoryCluster>,
    pub reconciler: Arc<Reconciler>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(MemoryCluster::new(), fast_settings())
    }

    /// Harness whose cluster delays each write by `latency`.
    pub fn with_write_latency(latency: Duration) -> Self {
        Self::build(MemoryCluster::new().with_write_latency(latency), fast_settings())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::build(MemoryCluster::new(), settings)
    }

    fn build(cluster: MemoryCluster, settings: EngineSettings) -> Self {
        let source = Arc::new(MemorySource::new());
        let cluster = Arc::new(cluster);
        let reconciler = Arc::new(Reconciler::new(settings, source.clone(), cluster.clone()));
        Self {
            source,
            cluster,
            reconciler,
        }
    }

    /// Commits every chart in one revision without notifying anyone.
    pub fn commit(&self, charts: &[&ChartBuilder]) -> RevisionId {
        let files: Vec<(String, String)> = charts.iter().flat_map(|c| c.files()).collect();
        self.source.commit(REPO, BRANCH, files)
    }

    /// Commits and notifies the reconciler, as a webhook would.
    pub async fn push(&self, charts: &[&ChartBuilder]) -> RevisionId {
        let revision = self.commit(charts);
        self.reconciler.notify_revision(REPO, Some(&revision)).await;
        revision
    }

    pub fn register(&self, app: ApplicationResource) {
        self.reconciler
            .register(app)
            .expect("failed to register application");
    }

    pub async fn refresh(&self, name: &str) -> ReconcileOutcome {
        self.reconciler
            .reconcile(name, SyncTrigger::Refresh)
            .await
            .expect("refresh cycle failed")
    }

    pub async fn sync(&self, name: &str) -> ReconcileOutcome {
        self.reconciler.sync(name).await.expect("sync failed")
    }

    pub fn status(&self, name: &str) -> ApplicationStatus {
        self.reconciler.status(name).expect("unknown application")
    }

    /// Live object as stored by the cluster.
    pub fn live(&self, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        self.cluster
            .object(&ResourceKey::new(kind, namespace, name))
            .map(|live| live.object.into_value())
    }

    /// Value at `pointer` of a live object.
    pub fn live_field(&self, kind: &str, namespace: &str, name: &str, pointer: &str) -> Option<Value> {
        self.live(kind, namespace, name)
            .and_then(|object| object.pointer(pointer).cloned())
    }
}
