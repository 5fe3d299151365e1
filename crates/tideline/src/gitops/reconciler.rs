//! Reconciler: watch → render → diff → sync, once per Application cycle.
//!
//! Owns the Application registry and runs one cycle at a time per
//! Application under its cycle lock. Status and history sit behind a
//! separate short-lived lock so they can be read while a sync runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::cluster::{ClusterApi, LabelSelector, LiveResource};
use super::diff::{diff, DiffOptions, DiffResult, PatchAction};
use super::error::ReconcileError;
use super::events::{ApplicationEvent, ApplicationEventKind, EventBroadcaster};
use super::executor::{CancelFlag, ExecutorOptions, SyncExecutor};
use super::health::{aggregate, HealthStatus};
use super::history::{History, ResourceResult, ResourceStatus, SyncResult, SyncStatus};
use super::manifest::{ResourceKey, INSTANCE_LABEL};
use super::policy::{SyncDecision, SyncTrigger};
use super::render::{render_source, Release};
use super::resource::ApplicationResource;
use super::snapshot::{DesiredStateSnapshot, RevisionId};
use super::source::{SourceBackend, SourceLocator, SourceTree};
use super::status::{ApplicationStatus, ConditionKind, OperationState, StatusView, SyncPhase};
use super::validation::validate_application;
use super::watcher::{SourceWatcher, WatcherOptions};
use crate::config::EngineSettings;

type Result<T> = std::result::Result<T, ReconcileError>;

/// Result of one reconciliation cycle.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub application: String,
    /// Revision of the desired state the cycle worked against.
    pub revision: RevisionId,
    pub decision: SyncDecision,
    pub diff: DiffResult,
    /// Present when the executor ran.
    pub result: Option<SyncResult>,
    pub phase: SyncPhase,
    pub health: HealthStatus,
}

enum Observed {
    Cached(DesiredStateSnapshot),
    Fetched(SourceTree),
}

#[derive(Default)]
struct CycleState {
    /// Snapshot rendered from the revision last observed at the source.
    desired: Option<DesiredStateSnapshot>,
}

struct Shared {
    status: ApplicationStatus,
    history: History,
}

struct AppEntry {
    spec: ApplicationResource,
    cycle: tokio::sync::Mutex<CycleState>,
    shared: Mutex<Shared>,
    cancel: Mutex<Option<CancelFlag>>,
    removed: AtomicBool,
}

impl AppEntry {
    fn new(spec: ApplicationResource, settings: &EngineSettings) -> Self {
        Self {
            spec,
            cycle: tokio::sync::Mutex::new(CycleState::default()),
            shared: Mutex::new(Shared {
                status: ApplicationStatus::default(),
                history: History::new(settings.history_limit, settings.result_history_limit),
            }),
            cancel: Mutex::new(None),
            removed: AtomicBool::new(false),
        }
    }

    fn name(&self) -> &str {
        self.spec.name()
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_slot(&self) -> std::sync::MutexGuard<'_, Option<CancelFlag>> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn locator(&self) -> SourceLocator {
        SourceLocator::from(&self.spec.spec.source)
    }
}

/// Keeps registered Applications converged with their sources.
pub struct Reconciler {
    settings: EngineSettings,
    watcher: SourceWatcher,
    cluster: Arc<dyn ClusterApi>,
    executor: SyncExecutor,
    apps: RwLock<BTreeMap<String, Arc<AppEntry>>>,
    events: EventBroadcaster,
}

impl Reconciler {
    pub fn new(
        settings: EngineSettings,
        source: Arc<dyn SourceBackend>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        let watcher = SourceWatcher::new(source, WatcherOptions::from(&settings));
        Self {
            settings,
            watcher,
            executor: SyncExecutor::new(Arc::clone(&cluster)),
            cluster,
            apps: RwLock::new(BTreeMap::new()),
            events: EventBroadcaster::default(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApplicationEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Registers `app`. Nothing is written until the first cycle.
    pub fn register(&self, app: ApplicationResource) -> Result<()> {
        let errors = validate_application(&app);
        if !errors.is_empty() {
            return Err(ReconcileError::Validation(errors.join("; ")));
        }

        let name = app.name().to_string();
        {
            let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());
            if apps.contains_key(&name) {
                return Err(ReconcileError::ApplicationExists(name));
            }
            let entry = AppEntry::new(app, &self.settings);
            apps.insert(name.clone(), Arc::new(entry));
        }

        log::info!("Registered application '{}'", name);
        self.events.send(&name, ApplicationEventKind::Registered);
        Ok(())
    }

    /// Unregisters `name`, waiting for an in-flight cycle to stop.
    ///
    /// With `cascade`, every live object labelled with the Application is
    /// deleted first; the per-resource outcomes are returned.
    pub async fn remove(&self, name: &str, cascade: bool) -> Result<Vec<ResourceResult>> {
        let entry = self.entry(name)?;
        if let Some(flag) = entry.cancel_slot().as_ref() {
            flag.cancel();
        }

        let _cycle = entry.cycle.lock().await;
        if entry.removed.load(Ordering::Acquire) {
            return Err(ReconcileError::ApplicationNotFound(name.to_string()));
        }

        let mut deleted = Vec::new();
        if cascade {
            let live = self.read_live(&entry, None).await?;
            let empty = DesiredStateSnapshot::new(RevisionId::new(""), BTreeMap::new());
            let no_history = BTreeMap::new();
            let plan = diff(
                &empty,
                &live,
                DiffOptions {
                    application: name,
                    prune: true,
                    self_heal: false,
                    last_applied: &no_history,
                },
            );
            let options = ExecutorOptions::resolve(&self.settings, entry.spec.spec.sync_policy.retry.as_ref());
            let report = self
                .executor
                .execute(&plan.patches, &options, &CancelFlag::new())
                .await;
            log::info!(
                "Cascade delete of '{}' removed {} of {} object(s)",
                name,
                report.applied(&plan.patches).count(),
                plan.patches.len()
            );
            deleted = report.resources;
        }

        entry.removed.store(true, Ordering::Release);
        self.apps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        log::info!("Removed application '{}'", name);
        self.events
            .send(name, ApplicationEventKind::Removed { cascade });
        Ok(deleted)
    }

    /// Registered Application names, sorted.
    pub fn applications(&self) -> Vec<String> {
        self.apps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Applications whose source lives in `repo_url`.
    pub fn applications_for_repo(&self, repo_url: &str) -> Vec<String> {
        self.apps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.spec.spec.source.repo_url == repo_url)
            .map(|e| e.name().to_string())
            .collect()
    }

    pub fn application(&self, name: &str) -> Option<ApplicationResource> {
        self.entry(name).ok().map(|e| e.spec.clone())
    }

    /// Polling interval of `name`: its own, else the engine default.
    pub fn refresh_interval(&self, name: &str) -> Result<std::time::Duration> {
        let entry = self.entry(name)?;
        let secs = entry
            .spec
            .spec
            .sync_policy
            .refresh_interval_secs
            .unwrap_or(self.settings.refresh_interval_secs);
        Ok(std::time::Duration::from_secs(secs))
    }

    fn entry(&self, name: &str) -> Result<Arc<AppEntry>> {
        self.apps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ReconcileError::ApplicationNotFound(name.to_string()))
    }

    // ------------------------------------------------------------------
    // Operator commands
    // ------------------------------------------------------------------

    /// Operator sync: applies pending changes and reverts drift.
    pub async fn sync(&self, name: &str) -> Result<ReconcileOutcome> {
        self.reconcile(name, SyncTrigger::Manual).await
    }

    /// Forces a fresh resolve of the source, then runs a refresh cycle.
    pub async fn refresh(&self, name: &str) -> Result<ReconcileOutcome> {
        let entry = self.entry(name)?;
        self.watcher.invalidate(&entry.spec.spec.source.repo_url).await;
        self.reconcile(name, SyncTrigger::Refresh).await
    }

    /// Re-applies a retained snapshot. Only manual Applications can be
    /// rolled back.
    pub async fn rollback(&self, name: &str, revision: &RevisionId) -> Result<ReconcileOutcome> {
        let entry = self.entry(name)?;
        self.admit(&entry, SyncTrigger::Rollback)?;
        let span = info_span!("rollback", app = %name, revision = %revision.short());
        self.run_cycle(&entry, SyncTrigger::Rollback, Some(revision))
            .instrument(span)
            .await
    }

    /// Runs one full cycle for `name`.
    pub async fn reconcile(&self, name: &str, trigger: SyncTrigger) -> Result<ReconcileOutcome> {
        let entry = self.entry(name)?;
        self.admit(&entry, trigger)?;
        let span = info_span!("reconcile", app = %name, trigger = %trigger);
        self.run_cycle(&entry, trigger, None).instrument(span).await
    }

    pub fn get_status(&self, name: &str) -> Result<StatusView> {
        let entry = self.entry(name)?;
        let shared = entry.shared();
        Ok(StatusView {
            name: name.to_string(),
            health: shared.status.health,
            sync_status: shared.status.phase,
            last_revision: shared.status.last_revision.clone(),
            observed_revision: shared.status.observed_revision.clone(),
            conditions: shared.status.conditions.clone(),
            last_result: shared.history.last_result().cloned(),
        })
    }

    /// Full runtime status of `name`.
    pub fn status(&self, name: &str) -> Result<ApplicationStatus> {
        Ok(self.entry(name)?.shared().status.clone())
    }

    /// Sync results of `name`, oldest first.
    pub fn history(&self, name: &str) -> Result<Vec<SyncResult>> {
        Ok(self.entry(name)?.shared().history.results().cloned().collect())
    }

    /// Revisions that can be rolled back to, oldest first.
    pub fn revisions(&self, name: &str) -> Result<Vec<RevisionId>> {
        Ok(self.entry(name)?.shared().history.revisions())
    }

    /// Reacts to a source change on `repo_url`.
    ///
    /// Drops cached resolves and cancels in-flight syncs whose revision is
    /// no longer the head. Without a known `revision` the head is resolved
    /// per Application. Returns the Applications whose sync was cancelled.
    pub async fn notify_revision(&self, repo_url: &str, revision: Option<&RevisionId>) -> Vec<String> {
        self.watcher.invalidate(repo_url).await;

        let entries: Vec<Arc<AppEntry>> = self
            .apps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.spec.spec.source.repo_url == repo_url)
            .cloned()
            .collect();

        let mut cancelled = Vec::new();
        for entry in entries {
            let running = entry.shared().status.operation.as_ref().map(|op| op.revision.clone());
            let Some(running) = running else {
                continue;
            };
            let head = match revision {
                Some(rev) => rev.clone(),
                None => match self.watcher.resolve(&entry.locator()).await {
                    Ok(rev) => rev,
                    Err(e) => {
                        log::warn!("Could not resolve head for '{}': {}", entry.name(), e);
                        continue;
                    }
                },
            };
            if head == running {
                continue;
            }
            if let Some(flag) = entry.cancel_slot().as_ref() {
                log::info!(
                    "Cancelling sync of '{}' at {}: superseded by {}",
                    entry.name(),
                    running.short(),
                    head.short()
                );
                flag.cancel();
                cancelled.push(entry.name().to_string());
            }
        }
        cancelled
    }

    // ------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------

    fn admit(&self, entry: &AppEntry, trigger: SyncTrigger) -> Result<()> {
        entry
            .spec
            .spec
            .sync_policy
            .admits(entry.name(), trigger)
            .inspect_err(|e| {
                log::warn!("{}", e);
                if let ReconcileError::PolicyViolation { reason, .. } = e {
                    self.events.send(
                        entry.name(),
                        ApplicationEventKind::PolicyRejected {
                            reason: reason.clone(),
                        },
                    );
                }
            })
    }

    async fn run_cycle(
        &self,
        entry: &AppEntry,
        trigger: SyncTrigger,
        pinned: Option<&RevisionId>,
    ) -> Result<ReconcileOutcome> {
        let name = entry.name();
        let mut cycle = entry.cycle.lock().await;
        if entry.removed.load(Ordering::Acquire) {
            return Err(ReconcileError::ApplicationNotFound(name.to_string()));
        }

        let before = {
            let shared = entry.shared();
            (shared.status.phase, shared.status.health)
        };

        let desired = match pinned {
            Some(revision) => retained(entry, revision)?,
            None => self.observe(entry, &mut cycle).await?,
        };

        let live = match self.read_live(entry, Some(&desired)).await {
            Ok(live) => live,
            Err(e) => {
                entry
                    .shared()
                    .status
                    .set_condition(ConditionKind::SyncError, format!("reading live state: {}", e));
                return Err(e);
            }
        };

        let policy = &entry.spec.spec.sync_policy;
        let plan = {
            let shared = entry.shared();
            diff(
                &desired,
                &live,
                DiffOptions {
                    application: name,
                    prune: policy.prune,
                    self_heal: policy.heals_drift(trigger),
                    last_applied: shared.history.last_applied(),
                },
            )
        };
        let decision = policy.decide(name, trigger, &plan)?;
        log::debug!(
            "Diff for '{}' at {}: {} patch(es), {} drifted, {} orphan(s) => {:?}",
            name,
            desired.revision().short(),
            plan.patches.len(),
            plan.drift.len(),
            plan.orphans.len(),
            decision
        );

        let (result, live) = match decision {
            SyncDecision::Noop => {
                let mut shared = entry.shared();
                shared.status.transition(SyncPhase::Synced)?;
                shared.status.last_revision = Some(desired.revision().clone());
                (None, live)
            }
            SyncDecision::ReportOnly => {
                entry.shared().status.transition(SyncPhase::OutOfSync)?;
                (None, live)
            }
            SyncDecision::Apply => {
                let result = self.apply(entry, trigger, &desired, &plan).await?;
                let live = self.read_live(entry, Some(&desired)).await?;
                (Some(result), live)
            }
        };

        let outcome = {
            let mut shared = entry.shared();
            update_conditions(&mut shared.status, &plan, result.as_ref());

            // Objects already matching the desired state count as applied.
            let pending: BTreeSet<&ResourceKey> = plan
                .patches
                .iter()
                .map(|p| &p.key)
                .chain(plan.drift.iter().map(|d| &d.key))
                .collect();
            for (key, manifest) in desired.resources() {
                if !pending.contains(key)
                    && live.contains_key(key)
                    && shared.history.last_applied().get(key) != Some(manifest)
                {
                    shared.history.record_applied(manifest.clone());
                }
            }

            shared.status.health = aggregate(&desired, &live);
            shared.status.reconciled_at = Some(Utc::now());

            ReconcileOutcome {
                application: name.to_string(),
                revision: desired.revision().clone(),
                decision,
                diff: plan,
                result,
                phase: shared.status.phase,
                health: shared.status.health,
            }
        };

        if (outcome.phase, outcome.health) != before {
            log::info!(
                "Application '{}' is {} / {}",
                name,
                outcome.phase,
                outcome.health
            );
            self.events.send(
                name,
                ApplicationEventKind::StatusChanged {
                    phase: outcome.phase,
                    health: outcome.health,
                },
            );
        }
        Ok(outcome)
    }

    /// Polls the source and renders a new snapshot when the revision moved.
    async fn observe(
        &self,
        entry: &AppEntry,
        cycle: &mut CycleState,
    ) -> Result<DesiredStateSnapshot> {
        let name = entry.name();
        let locator = entry.locator();
        let since = entry.shared().status.observed_revision.clone();

        let observed = async {
            let outcome = self.watcher.poll(&locator, since.as_ref()).await?;
            let revision = outcome.revision().clone();
            let cached = cycle
                .desired
                .as_ref()
                .filter(|snapshot| snapshot.revision() == &revision)
                .cloned();
            match cached {
                Some(snapshot) => Ok((revision, Observed::Cached(snapshot))),
                None => {
                    let tree = self.watcher.fetch(&locator, &revision).await?;
                    Ok((revision, Observed::Fetched(tree)))
                }
            }
        }
        .await;

        let (revision, observed) = match observed {
            Ok(observed) => observed,
            Err(e) => {
                self.record_source_failure(entry, &e);
                return Err(e);
            }
        };

        {
            let mut shared = entry.shared();
            if shared.status.consecutive_source_failures > 0 {
                log::info!(
                    "Source of '{}' reachable again after {} failure(s)",
                    name,
                    shared.status.consecutive_source_failures
                );
            }
            shared.status.consecutive_source_failures = 0;
            shared.status.clear_condition(ConditionKind::SourceUnavailable);
            shared.status.observed_revision = Some(revision.clone());
        }

        let tree = match observed {
            Observed::Cached(snapshot) => return Ok(snapshot),
            Observed::Fetched(tree) => tree,
        };

        let spec = &entry.spec.spec;
        let release = Release::new(name, spec.destination.namespace.as_str());
        match render_source(&tree, &spec.source, &revision, &release) {
            Ok(snapshot) => {
                log::info!(
                    "Rendered {} resource(s) for '{}' at {}",
                    snapshot.len(),
                    name,
                    revision.short()
                );
                let mut shared = entry.shared();
                shared.status.clear_condition(ConditionKind::RenderError);
                shared.history.retain_snapshot(snapshot.clone());
                drop(shared);
                cycle.desired = Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                let message = e.to_string();
                log::error!("Render of '{}' at {} failed: {}", name, revision.short(), message);
                entry
                    .shared()
                    .status
                    .set_condition(ConditionKind::RenderError, message.clone());
                self.events
                    .send(name, ApplicationEventKind::RenderFailed { message });
                Err(ReconcileError::Render(e))
            }
        }
    }

    fn record_source_failure(&self, entry: &AppEntry, error: &ReconcileError) {
        let name = entry.name();
        let threshold = self.settings.unknown_after_failures;
        let failures = {
            let mut shared = entry.shared();
            shared.status.consecutive_source_failures += 1;
            let failures = shared.status.consecutive_source_failures;
            if failures >= threshold {
                shared.status.health = HealthStatus::Unknown;
                shared
                    .status
                    .set_condition(ConditionKind::SourceUnavailable, error.to_string());
            }
            failures
        };

        log::warn!(
            "Source of '{}' unavailable ({} consecutive): {}",
            name,
            failures,
            error
        );
        if failures >= threshold {
            self.events.send(
                name,
                ApplicationEventKind::SourceUnavailable {
                    consecutive_failures: failures,
                    message: error.to_string(),
                },
            );
        }
    }

    /// Live objects of the Application: everything carrying its tracking
    /// label, plus any desired object not yet labelled.
    async fn read_live(
        &self,
        entry: &AppEntry,
        desired: Option<&DesiredStateSnapshot>,
    ) -> Result<BTreeMap<ResourceKey, LiveResource>> {
        let selector = LabelSelector::new(INSTANCE_LABEL, entry.name());
        let mut live: BTreeMap<ResourceKey, LiveResource> = self
            .cluster
            .list(&selector)
            .await?
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        if let Some(desired) = desired {
            for key in desired.resources().keys() {
                if live.contains_key(key) {
                    continue;
                }
                if let Some(found) = self.cluster.get(key).await? {
                    live.insert(key.clone(), found);
                }
            }
        }
        Ok(live)
    }

    /// Runs the executor over `plan` and records the result.
    async fn apply(
        &self,
        entry: &AppEntry,
        trigger: SyncTrigger,
        desired: &DesiredStateSnapshot,
        plan: &DiffResult,
    ) -> Result<SyncResult> {
        let name = entry.name();
        let revision = desired.revision().clone();
        let started_at = Utc::now();
        let cancel = CancelFlag::new();

        {
            let mut shared = entry.shared();
            shared.status.transition(SyncPhase::OutOfSync)?;
            shared.status.transition(SyncPhase::Syncing)?;
            shared.status.operation = Some(OperationState {
                id: Uuid::new_v4(),
                trigger,
                revision: revision.clone(),
                started_at,
            });
        }
        *entry.cancel_slot() = Some(cancel.clone());

        log::info!(
            "Syncing '{}' to {} ({} create, {} update, {} delete)",
            name,
            revision.short(),
            plan.count(PatchAction::Create),
            plan.count(PatchAction::Update),
            plan.count(PatchAction::Delete)
        );
        self.events.send(
            name,
            ApplicationEventKind::SyncStarted {
                revision: revision.clone(),
                trigger,
                patches: plan.patches.len(),
            },
        );

        let options = ExecutorOptions::resolve(&self.settings, entry.spec.spec.sync_policy.retry.as_ref());
        let report = self.executor.execute(&plan.patches, &options, &cancel).await;
        *entry.cancel_slot() = None;

        let result = SyncResult::from_resources(name, revision.clone(), trigger, started_at, report.resources.clone());

        {
            let mut shared = entry.shared();
            for patch in report.applied(&plan.patches) {
                match patch.action {
                    PatchAction::Delete => shared.history.forget_applied(&patch.key),
                    PatchAction::Create | PatchAction::Update => {
                        shared.history.record_applied(patch.manifest.clone())
                    }
                }
            }
            shared.history.push_result(result.clone());
            shared.status.operation = None;

            let next = match result.status {
                SyncStatus::Error => SyncPhase::Error,
                SyncStatus::OutOfSync => SyncPhase::OutOfSync,
                SyncStatus::Synced => {
                    shared.status.last_revision = Some(revision.clone());
                    let unresolved_drift = plan
                        .drift
                        .iter()
                        .any(|d| !plan.patches.iter().any(|p| p.key == d.key));
                    if unresolved_drift || !plan.orphans.is_empty() {
                        SyncPhase::OutOfSync
                    } else {
                        SyncPhase::Synced
                    }
                }
            };
            shared.status.transition(next)?;
        }

        match result.status {
            SyncStatus::Error => log::warn!(
                "Sync of '{}' to {} finished with {} failed resource(s)",
                name,
                revision.short(),
                result.count(ResourceStatus::Error)
            ),
            SyncStatus::OutOfSync => log::info!(
                "Sync of '{}' to {} cancelled after {} resource(s)",
                name,
                revision.short(),
                result.count(ResourceStatus::Synced)
            ),
            SyncStatus::Synced => log::info!("Synced '{}' to {}", name, revision.short()),
        }
        self.events.send(
            name,
            ApplicationEventKind::SyncCompleted {
                revision,
                status: result.status,
            },
        );
        Ok(result)
    }
}

fn retained(entry: &AppEntry, revision: &RevisionId) -> Result<DesiredStateSnapshot> {
    entry
        .shared()
        .history
        .snapshot(revision)
        .cloned()
        .ok_or_else(|| ReconcileError::RevisionNotFound {
            application: entry.name().to_string(),
            revision: revision.to_string(),
        })
}

/// Sets the drift, orphan and sync-error conditions from the latest plan
/// and the sync that ran on it, if any.
fn update_conditions(status: &mut ApplicationStatus, plan: &DiffResult, result: Option<&SyncResult>) {
    let applied: BTreeSet<&ResourceKey> = result
        .iter()
        .flat_map(|r| r.resources.iter())
        .filter(|r| r.status == ResourceStatus::Synced)
        .map(|r| &r.key)
        .collect();

    let drifted: Vec<String> = plan
        .drift
        .iter()
        .filter(|d| !applied.contains(&d.key))
        .map(|d| d.key.to_string())
        .collect();
    set_or_clear(status, ConditionKind::DriftDetected, "resource(s) differ from the last sync", drifted);

    let orphans: Vec<String> = plan.orphans.iter().map(|k| k.to_string()).collect();
    set_or_clear(status, ConditionKind::OrphanedResources, "resource(s) no longer declared", orphans);

    match result {
        Some(result) => {
            let failures = |conflict: bool| -> Vec<String> {
                result
                    .resources
                    .iter()
                    .filter(|r| r.status == ResourceStatus::Error)
                    .filter(|r| (r.reason.as_deref() == Some("DiffConflict")) == conflict)
                    .map(|r| match r.errors.last() {
                        Some(error) => format!("{} ({})", r.key, error),
                        None => r.key.to_string(),
                    })
                    .collect()
            };
            set_or_clear(status, ConditionKind::SyncError, "resource(s) failed to apply", failures(false));
            set_or_clear(status, ConditionKind::DiffConflict, "resource(s) modified concurrently", failures(true));
        }
        None if status.phase == SyncPhase::Synced => {
            status.clear_condition(ConditionKind::SyncError);
            status.clear_condition(ConditionKind::DiffConflict);
        }
        None => {}
    }
}

fn set_or_clear(status: &mut ApplicationStatus, kind: ConditionKind, what: &str, items: Vec<String>) {
    if items.is_empty() {
        status.clear_condition(kind);
    } else {
        status.set_condition(kind, format!("{} {}: {}", items.len(), what, items.join(", ")));
    }
}
