//! Source watching: revision polling with shared, bounded resolves, and
//! filesystem change notifications for local sources.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use moka::future::Cache;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::error::{GitOpsError, ReconcileError};
use super::executor::backoff_delay;
use super::snapshot::RevisionId;
use super::source::{SourceBackend, SourceLocator, SourceTree};
use crate::config::EngineSettings;

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The source moved to a revision other than the one last seen.
    Changed(RevisionId),
    /// The source still points at the last seen revision.
    Unchanged(RevisionId),
}

impl PollOutcome {
    pub fn revision(&self) -> &RevisionId {
        match self {
            PollOutcome::Changed(rev) | PollOutcome::Unchanged(rev) => rev,
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, PollOutcome::Changed(_))
    }
}

/// Deadlines and retry budget for source calls.
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub poll_timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub cache_ttl: Duration,
}

impl From<&EngineSettings> for WatcherOptions {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            poll_timeout: Duration::from_secs(settings.poll_timeout_secs),
            max_retries: settings.retry.max_retries,
            base_delay: Duration::from_millis(settings.retry.base_delay_ms),
            max_delay: Duration::from_millis(settings.retry.max_delay_ms),
            cache_ttl: Duration::from_secs(settings.source_cache_ttl_secs),
        }
    }
}

type ResolveKey = (String, String);

/// Polls sources on behalf of any number of Applications.
///
/// Resolves of the same (repository, target revision) are serialised and
/// their results cached briefly, so Applications sharing a source issue one
/// backend call per cache window.
pub struct SourceWatcher {
    backend: Arc<dyn SourceBackend>,
    options: WatcherOptions,
    resolved: Cache<ResolveKey, RevisionId>,
    locks: Mutex<HashMap<ResolveKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SourceWatcher {
    pub fn new(backend: Arc<dyn SourceBackend>, options: WatcherOptions) -> Self {
        let resolved = Cache::builder()
            .max_capacity(1024)
            .time_to_live(options.cache_ttl)
            .build();
        Self {
            backend,
            options,
            resolved,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &WatcherOptions {
        &self.options
    }

    /// Resolves `locator` and compares it with the revision last seen.
    pub async fn poll(
        &self,
        locator: &SourceLocator,
        since: Option<&RevisionId>,
    ) -> Result<PollOutcome, ReconcileError> {
        let revision = self.resolve(locator).await?;
        if since == Some(&revision) {
            Ok(PollOutcome::Unchanged(revision))
        } else {
            Ok(PollOutcome::Changed(revision))
        }
    }

    /// Resolves `locator`, sharing in-flight and recent results.
    pub async fn resolve(&self, locator: &SourceLocator) -> Result<RevisionId, ReconcileError> {
        let key = locator.resolve_key();
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if let Some(revision) = self.resolved.get(&key).await {
            return Ok(revision);
        }

        let revision = self
            .with_retry(locator, || self.backend.resolve(locator))
            .await?;
        log::debug!("Resolved {} to {}", locator, revision.short());
        self.resolved.insert(key, revision.clone()).await;
        Ok(revision)
    }

    /// Reads the tree of a resolved revision.
    pub async fn fetch(
        &self,
        locator: &SourceLocator,
        revision: &RevisionId,
    ) -> Result<SourceTree, ReconcileError> {
        self.with_retry(locator, || self.backend.read_tree(locator, revision))
            .await
    }

    /// Drops the cached resolve so the next poll reaches the backend.
    pub async fn invalidate(&self, repo_url: &str) {
        let repo_url = repo_url.to_string();
        let keys: Vec<ResolveKey> = {
            let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .keys()
                .filter(|(url, _)| *url == repo_url)
                .cloned()
                .collect()
        };
        for key in keys {
            self.resolved.invalidate(&key).await;
        }
    }

    fn lock_for(&self, key: &ResolveKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Runs `op` under the poll deadline, retrying transient failures with
    /// exponential backoff.
    async fn with_retry<T, F, Fut>(&self, locator: &SourceLocator, op: F) -> Result<T, ReconcileError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GitOpsError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.options.poll_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(GitOpsError::GitTimeout(self.options.poll_timeout.as_secs())),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt <= self.options.max_retries => {
                    let delay =
                        backoff_delay(self.options.base_delay, attempt, self.options.max_delay);
                    log::warn!(
                        "Source {} failed (attempt {}/{}), retrying in {:?}: {}",
                        locator,
                        attempt,
                        self.options.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log::error!("Source {} unavailable after {} attempt(s): {}", locator, attempt, e);
                    return Err(ReconcileError::SourceUnavailable {
                        locator: locator.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

// ============================================================================
// Change notifications
// ============================================================================

/// A source changed and dependent Applications should refresh now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChangeEvent {
    pub repo_url: String,
    /// Changed path relative to the source root, empty when unknown.
    #[serde(default)]
    pub path: String,
}

impl SourceChangeEvent {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            path: String::new(),
        }
    }
}

/// Watches a local source directory and broadcasts changes.
pub struct ChangeNotifier {
    repo_url: String,
    root: PathBuf,
    sender: broadcast::Sender<SourceChangeEvent>,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<Result<(), GitOpsError>>>,
}

impl ChangeNotifier {
    pub fn new(repo_url: impl Into<String>) -> Self {
        let repo_url = repo_url.into();
        let root = super::source::DirectorySource::root_for(&repo_url);
        let (sender, _) = broadcast::channel(100);
        Self {
            repo_url,
            root,
            sender,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Publishes into an existing channel instead of a private one.
    pub fn with_sender(mut self, sender: broadcast::Sender<SourceChangeEvent>) -> Self {
        self.sender = sender;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceChangeEvent> {
        self.sender.subscribe()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Starts watching in a background thread. Idempotent.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let repo_url = self.repo_url.clone();
        let root = self.root.clone();
        let sender = self.sender.clone();
        let shutdown = Arc::clone(&self.shutdown);
        self.handle = Some(std::thread::spawn(move || {
            watch_loop(&repo_url, &root, &sender, &shutdown)
        }));
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Err(e)) => log::warn!("Change notifier for {} ended with error: {}", self.repo_url, e),
                Err(_) => log::warn!("Change notifier thread for {} panicked", self.repo_url),
                Ok(Ok(())) => {}
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(
    repo_url: &str,
    root: &Path,
    sender: &broadcast::Sender<SourceChangeEvent>,
    shutdown: &AtomicBool,
) -> Result<(), GitOpsError> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer: Debouncer<RecommendedWatcher> =
        new_debouncer(Duration::from_millis(500), tx)
            .map_err(|e| GitOpsError::WatchError(e.to_string()))?;
    debouncer
        .watcher()
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| GitOpsError::WatchError(e.to_string()))?;

    log::info!("Watching {} for changes", root.display());

    while !shutdown.load(Ordering::Acquire) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(events)) => {
                for event in events {
                    if let Some(change) = process_event(repo_url, root, &event) {
                        let _ = sender.send(change);
                    }
                }
            }
            Ok(Err(e)) => log::error!("Watch error on {}: {}", root.display(), e),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("Stopped watching {}", root.display());
    Ok(())
}

/// Maps a filesystem event to a change event; hidden paths are ignored.
fn process_event(repo_url: &str, root: &Path, event: &DebouncedEvent) -> Option<SourceChangeEvent> {
    let relative = event.path.strip_prefix(root).ok()?;
    let hidden = relative.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
    });
    if hidden {
        return None;
    }
    Some(SourceChangeEvent {
        repo_url: repo_url.to_string(),
        path: relative.to_string_lossy().replace('\\', "/"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::source::MemorySource;
    use tempfile::TempDir;

    const REPO: &str = "mem://shared";

    fn options() -> WatcherOptions {
        WatcherOptions {
            poll_timeout: Duration::from_millis(200),
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            cache_ttl: Duration::from_secs(60),
        }
    }

    fn watcher(source: Arc<MemorySource>) -> SourceWatcher {
        SourceWatcher::new(source, options())
    }

    #[tokio::test]
    async fn test_poll_changed_then_unchanged() {
        let source = Arc::new(MemorySource::new());
        let rev = source.commit(REPO, "main", [("a.yaml", "1")]);
        let watcher = watcher(Arc::clone(&source));
        let locator = SourceLocator::new(REPO, "main", ".");

        let first = watcher.poll(&locator, None).await.unwrap();
        assert_eq!(first, PollOutcome::Changed(rev.clone()));
        let second = watcher.poll(&locator, Some(&rev)).await.unwrap();
        assert_eq!(second, PollOutcome::Unchanged(rev));
    }

    #[tokio::test]
    async fn test_concurrent_polls_share_one_resolve() {
        let source = Arc::new(MemorySource::new().with_resolve_delay(Duration::from_millis(20)));
        source.commit(REPO, "main", [("a.yaml", "1")]);
        let watcher = Arc::new(watcher(Arc::clone(&source)));

        let mut handles = Vec::new();
        for path in ["app-a", "app-b", "app-c", "app-d"] {
            let watcher = Arc::clone(&watcher);
            handles.push(tokio::spawn(async move {
                let locator = SourceLocator::new(REPO, "main", path);
                watcher.poll(&locator, None).await
            }));
        }
        let mut revisions = Vec::new();
        for handle in handles {
            revisions.push(handle.await.unwrap().unwrap().revision().clone());
        }

        revisions.dedup();
        assert_eq!(revisions.len(), 1);
        assert_eq!(source.resolve_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let source = Arc::new(MemorySource::new());
        source.commit(REPO, "main", [("a.yaml", "1")]);
        source.fail_next(REPO, 2);
        let watcher = watcher(Arc::clone(&source));

        let outcome = watcher.poll(&SourceLocator::new(REPO, "main", "."), None).await;
        assert!(outcome.is_ok());
        assert_eq!(source.resolve_calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_source_unavailable() {
        let source = Arc::new(MemorySource::new());
        source.commit(REPO, "main", [("a.yaml", "1")]);
        source.set_unavailable(REPO, true);
        let watcher = watcher(Arc::clone(&source));

        let err = watcher
            .poll(&SourceLocator::new(REPO, "main", "."), None)
            .await
            .unwrap_err();
        match err {
            ReconcileError::SourceUnavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_backoff_is_capped() {
        let source = Arc::new(MemorySource::new());
        source.commit(REPO, "main", [("a.yaml", "1")]);
        source.set_unavailable(REPO, true);
        let watcher = SourceWatcher::new(
            source,
            WatcherOptions {
                max_retries: 6,
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(15),
                ..options()
            },
        );

        let started = tokio::time::Instant::now();
        let err = watcher
            .poll(&SourceLocator::new(REPO, "main", "."), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::SourceUnavailable { attempts: 7, .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10 + 5 * 15), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(10 + 6 * 15), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let source = Arc::new(MemorySource::new().with_resolve_delay(Duration::from_secs(5)));
        source.commit(REPO, "main", [("a.yaml", "1")]);
        let watcher = SourceWatcher::new(
            source,
            WatcherOptions {
                max_retries: 0,
                ..options()
            },
        );

        let err = watcher
            .poll(&SourceLocator::new(REPO, "main", "."), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalidate_sees_new_commit() {
        let source = Arc::new(MemorySource::new());
        let first = source.commit(REPO, "main", [("a.yaml", "1")]);
        let watcher = watcher(Arc::clone(&source));
        let locator = SourceLocator::new(REPO, "main", ".");
        assert_eq!(watcher.resolve(&locator).await.unwrap(), first);

        let second = source.commit(REPO, "main", [("a.yaml", "2")]);
        assert_eq!(watcher.resolve(&locator).await.unwrap(), first);
        watcher.invalidate(REPO).await;
        assert_eq!(watcher.resolve(&locator).await.unwrap(), second);
    }

    #[test]
    fn test_process_event_skips_hidden() {
        let dir = TempDir::new().unwrap();
        let visible = DebouncedEvent {
            path: dir.path().join("web/values.yaml"),
            kind: notify_debouncer_mini::DebouncedEventKind::Any,
        };
        let hidden = DebouncedEvent {
            path: dir.path().join(".git/index"),
            kind: notify_debouncer_mini::DebouncedEventKind::Any,
        };

        let event = process_event("file:///x", dir.path(), &visible).unwrap();
        assert_eq!(event.path, "web/values.yaml");
        assert_eq!(event.repo_url, "file:///x");
        assert!(process_event("file:///x", dir.path(), &hidden).is_none());
    }

    #[test]
    fn test_notifier_lifecycle() {
        let dir = TempDir::new().unwrap();
        let url = format!("file://{}", dir.path().display());
        let mut notifier = ChangeNotifier::new(url);
        assert_eq!(notifier.root(), dir.path());

        notifier.start();
        assert!(!notifier.is_stopped());
        notifier.stop();
        assert!(notifier.is_stopped());
    }
}
