//! A local directory used as a configuration source.
//!
//! The directory has no history: its revision is the digest of its current
//! contents, and only the current revision can be read.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use super::{normalize_path, relative_to, tree_digest, SourceBackend, SourceLocator, SourceTree};
use crate::gitops::error::{GitOpsError, Result};
use crate::gitops::snapshot::RevisionId;

/// Reads a directory named by a `file://` URL or a plain path.
#[derive(Debug, Clone, Default)]
pub struct DirectorySource;

impl DirectorySource {
    pub fn new() -> Self {
        Self
    }

    /// Filesystem root for a repository URL.
    pub fn root_for(repo_url: &str) -> PathBuf {
        PathBuf::from(repo_url.strip_prefix("file://").unwrap_or(repo_url))
    }

    async fn snapshot(root: PathBuf) -> Result<SourceTree> {
        tokio::task::spawn_blocking(move || read_dir_tree(&root))
            .await
            .map_err(|e| GitOpsError::FileOperation(format!("directory read task failed: {}", e)))?
    }
}

/// Reads every visible UTF-8 file under `root`.
fn read_dir_tree(root: &Path) -> Result<SourceTree> {
    if !root.is_dir() {
        return Err(GitOpsError::SourceUnavailable(format!(
            "directory not found: {}",
            root.display()
        )));
    }

    let mut tree = SourceTree::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let hidden = relative.components().any(|c| {
            c.as_os_str()
                .to_str()
                .map(|s| s.starts_with('.'))
                .unwrap_or(false)
        });
        if hidden {
            continue;
        }

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                log::debug!("Skipping non-UTF-8 file {}", path.display());
                continue;
            }
            Err(source) => {
                return Err(GitOpsError::ReadFile {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        tree.insert(key, contents);
    }
    Ok(tree)
}

#[async_trait]
impl SourceBackend for DirectorySource {
    async fn resolve(&self, locator: &SourceLocator) -> Result<RevisionId> {
        let tree = Self::snapshot(Self::root_for(&locator.repo_url)).await?;
        Ok(tree_digest(tree.files()))
    }

    async fn read_tree(
        &self,
        locator: &SourceLocator,
        revision: &RevisionId,
    ) -> Result<SourceTree> {
        let dir = normalize_path(&locator.path)?;
        let tree = Self::snapshot(Self::root_for(&locator.repo_url)).await?;
        if &tree_digest(tree.files()) != revision {
            // The directory changed since it was resolved; the next poll picks it up.
            return Err(GitOpsError::RevisionNotFound(revision.to_string()));
        }
        Ok(tree
            .files()
            .filter_map(|(path, contents)| relative_to(path, &dir).map(|rel| (rel, contents)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("web/templates")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("web/Chart.yaml"), "name: web\nversion: 1.0.0\n").unwrap();
        fs::write(dir.path().join("web/templates/cm.yaml"), "kind: ConfigMap\n").unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_resolve_and_read() {
        let dir = setup();
        let url = format!("file://{}", dir.path().display());
        let locator = SourceLocator::new(url, "HEAD", "web");
        let source = DirectorySource::new();

        let rev = source.resolve(&locator).await.unwrap();
        assert_eq!(rev, source.resolve(&locator).await.unwrap());

        let tree = source.read_tree(&locator, &rev).await.unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.contains("templates/cm.yaml"));
        assert!(tree.get("Chart.yaml").unwrap().contains("name: web"));
    }

    #[tokio::test]
    async fn test_revision_changes_with_contents() {
        let dir = setup();
        let locator = SourceLocator::new(dir.path().to_string_lossy(), "HEAD", ".");
        let source = DirectorySource::new();

        let before = source.resolve(&locator).await.unwrap();
        fs::write(dir.path().join("web/templates/cm.yaml"), "kind: Secret\n").unwrap();
        let after = source.resolve(&locator).await.unwrap();
        assert_ne!(before, after);

        let stale = source.read_tree(&locator, &before).await;
        assert!(matches!(stale, Err(GitOpsError::RevisionNotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_directory_is_unavailable() {
        let locator = SourceLocator::new("/nonexistent/tideline-src", "HEAD", ".");
        let err = DirectorySource::new().resolve(&locator).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
