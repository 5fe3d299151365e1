//! In-process source for embedders and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{normalize_path, relative_to, tree_digest, SourceBackend, SourceLocator, SourceTree};
use crate::gitops::error::{GitOpsError, Result};
use crate::gitops::snapshot::RevisionId;

#[derive(Default)]
struct MemoryRepo {
    refs: HashMap<String, RevisionId>,
    commits: HashMap<RevisionId, BTreeMap<String, String>>,
    failures_remaining: u32,
    unavailable: bool,
}

/// Repositories held in memory. Commits are content-addressed.
#[derive(Default)]
pub struct MemorySource {
    repos: Mutex<HashMap<String, MemoryRepo>>,
    resolve_calls: AtomicUsize,
    resolve_delay: Option<Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slows down every resolve, to make concurrent polls overlap.
    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = Some(delay);
        self
    }

    /// Records a commit of `files` and points `reference` at it.
    pub fn commit<P, C>(
        &self,
        repo_url: &str,
        reference: &str,
        files: impl IntoIterator<Item = (P, C)>,
    ) -> RevisionId
    where
        P: Into<String>,
        C: Into<String>,
    {
        let files: BTreeMap<String, String> = files
            .into_iter()
            .map(|(p, c)| (p.into(), c.into()))
            .collect();
        let revision = tree_digest(files.iter().map(|(p, c)| (p.as_str(), c.as_str())));

        let mut repos = self.lock();
        let repo = repos.entry(repo_url.to_string()).or_default();
        repo.commits.insert(revision.clone(), files);
        repo.refs.insert(reference.to_string(), revision.clone());
        revision
    }

    /// Fails the next `count` resolves of `repo_url`.
    pub fn fail_next(&self, repo_url: &str, count: u32) {
        let mut repos = self.lock();
        repos.entry(repo_url.to_string()).or_default().failures_remaining = count;
    }

    /// Makes every call against `repo_url` fail until reset.
    pub fn set_unavailable(&self, repo_url: &str, unavailable: bool) {
        let mut repos = self.lock();
        repos.entry(repo_url.to_string()).or_default().unavailable = unavailable;
    }

    /// Number of resolves that reached this backend.
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryRepo>> {
        self.repos.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SourceBackend for MemorySource {
    async fn resolve(&self, locator: &SourceLocator) -> Result<RevisionId> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.resolve_delay {
            tokio::time::sleep(delay).await;
        }

        let mut repos = self.lock();
        let repo = repos
            .get_mut(&locator.repo_url)
            .ok_or_else(|| GitOpsError::SourceUnavailable(locator.repo_url.clone()))?;

        if repo.unavailable {
            return Err(GitOpsError::SourceUnavailable(locator.repo_url.clone()));
        }
        if repo.failures_remaining > 0 {
            repo.failures_remaining -= 1;
            return Err(GitOpsError::GitNetworkError(format!(
                "connection refused: {}",
                locator.repo_url
            )));
        }

        let pinned = RevisionId::new(locator.target_revision.as_str());
        if repo.commits.contains_key(&pinned) {
            return Ok(pinned);
        }
        repo.refs
            .get(&locator.target_revision)
            .cloned()
            .ok_or_else(|| GitOpsError::RevisionNotFound(locator.target_revision.clone()))
    }

    async fn read_tree(
        &self,
        locator: &SourceLocator,
        revision: &RevisionId,
    ) -> Result<SourceTree> {
        let dir = normalize_path(&locator.path)?;
        let repos = self.lock();
        let repo = repos
            .get(&locator.repo_url)
            .ok_or_else(|| GitOpsError::SourceUnavailable(locator.repo_url.clone()))?;
        if repo.unavailable {
            return Err(GitOpsError::SourceUnavailable(locator.repo_url.clone()));
        }
        let files = repo
            .commits
            .get(revision)
            .ok_or_else(|| GitOpsError::RevisionNotFound(revision.to_string()))?;

        Ok(files
            .iter()
            .filter_map(|(path, contents)| {
                relative_to(path, &dir).map(|rel| (rel.to_string(), contents.clone()))
            })
            .collect())
    }
}
