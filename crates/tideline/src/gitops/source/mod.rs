//! Read-only configuration sources.
//!
//! A source resolves a locator (repository + target revision) to an
//! immutable [`RevisionId`] and reads the file tree of a resolved revision.

pub mod directory;
pub mod memory;

use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{GitOpsError, Result};
use super::resource::ApplicationSource;
use super::snapshot::RevisionId;

pub use directory::DirectorySource;
pub use memory::MemorySource;

/// Where an Application's configuration lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocator {
    pub repo_url: String,
    pub target_revision: String,
    /// Directory inside the repository, `.` for the root.
    pub path: String,
}

impl SourceLocator {
    pub fn new(
        repo_url: impl Into<String>,
        target_revision: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            repo_url: repo_url.into(),
            target_revision: target_revision.into(),
            path: path.into(),
        }
    }

    /// Same repository and path, pinned to `revision`.
    pub fn at(&self, revision: &RevisionId) -> Self {
        Self {
            target_revision: revision.as_str().to_string(),
            ..self.clone()
        }
    }

    /// Identity used to share resolves between Applications.
    pub fn resolve_key(&self) -> (String, String) {
        (self.repo_url.clone(), self.target_revision.clone())
    }
}

impl From<&ApplicationSource> for SourceLocator {
    fn from(source: &ApplicationSource) -> Self {
        Self::new(&source.repo_url, &source.target_revision, &source.path)
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repo_url, self.target_revision)?;
        if !is_root_path(&self.path) {
            write!(f, ":{}", self.path)?;
        }
        Ok(())
    }
}

/// Files of one directory at one revision, keyed by `/`-separated path
/// relative to the locator's path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTree {
    files: BTreeMap<String, String>,
}

impl SourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<String>) {
        self.files.insert(path.into(), contents.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// All files, sorted by path.
    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Files under `dir/`, sorted by path.
    pub fn files_under<'a>(&'a self, dir: &str) -> impl Iterator<Item = (&'a str, &'a str)> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files()
            .filter(move |(path, _)| path.starts_with(&prefix))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<P: Into<String>, C: Into<String>> FromIterator<(P, C)> for SourceTree {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        let mut tree = SourceTree::new();
        for (path, contents) in iter {
            tree.insert(path, contents);
        }
        tree
    }
}

/// A read-only versioned configuration store.
#[async_trait]
pub trait SourceBackend: Send + Sync {
    /// Resolves `locator.target_revision` to an immutable revision.
    async fn resolve(&self, locator: &SourceLocator) -> Result<RevisionId>;

    /// Reads every file under `locator.path` at `revision`.
    async fn read_tree(&self, locator: &SourceLocator, revision: &RevisionId)
        -> Result<SourceTree>;
}

/// Dispatches to a backend by repository URL prefix.
pub struct SourceRouter {
    routes: Vec<(String, Arc<dyn SourceBackend>)>,
    fallback: Arc<dyn SourceBackend>,
}

impl SourceRouter {
    pub fn new(fallback: Arc<dyn SourceBackend>) -> Self {
        Self {
            routes: Vec::new(),
            fallback,
        }
    }

    /// Routes URLs starting with `prefix` to `backend`. First match wins.
    pub fn route(mut self, prefix: impl Into<String>, backend: Arc<dyn SourceBackend>) -> Self {
        self.routes.push((prefix.into(), backend));
        self
    }

    fn backend_for(&self, repo_url: &str) -> &Arc<dyn SourceBackend> {
        self.routes
            .iter()
            .find(|(prefix, _)| repo_url.starts_with(prefix.as_str()))
            .map(|(_, backend)| backend)
            .unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl SourceBackend for SourceRouter {
    async fn resolve(&self, locator: &SourceLocator) -> Result<RevisionId> {
        self.backend_for(&locator.repo_url).resolve(locator).await
    }

    async fn read_tree(
        &self,
        locator: &SourceLocator,
        revision: &RevisionId,
    ) -> Result<SourceTree> {
        self.backend_for(&locator.repo_url)
            .read_tree(locator, revision)
            .await
    }
}

/// True for `.`, `./` and the empty path.
pub fn is_root_path(path: &str) -> bool {
    matches!(path.trim_end_matches('/'), "" | ".")
}

/// Normalises a repository-relative directory to `a/b` form, rejecting
/// absolute paths and `..` components.
pub fn normalize_path(path: &str) -> Result<String> {
    if is_root_path(path) {
        return Ok(String::new());
    }
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(GitOpsError::PathTraversal(path.to_string())),
        }
    }
    Ok(parts.join("/"))
}

/// Strips `dir/` from `path`; `None` if `path` is outside `dir`.
pub(crate) fn relative_to<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    if dir.is_empty() {
        return Some(path);
    }
    path.strip_prefix(dir)?.strip_prefix('/')
}

/// Content revision of a file set: hex SHA-256 over paths and contents.
pub fn tree_digest<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> RevisionId {
    let mut hasher = Sha256::new();
    for (path, contents) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(contents.as_bytes());
        hasher.update([0u8]);
    }
    RevisionId::new(hex::encode(hasher.finalize()))
}
