//! Git repositories as configuration sources, driven through the git CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;

use super::auth::{build_auth_env, AuthEnv};
use super::parse::{format_git_error, is_commit_id, parse_ls_remote, parse_ls_tree};
use crate::gitops::error::{classify_git_error, GitOpsError, Result};
use crate::gitops::resource::{GitAuthSettings, RepositoryResource};
use crate::gitops::snapshot::RevisionId;
use crate::gitops::source::{normalize_path, relative_to, SourceBackend, SourceLocator, SourceTree};

/// Reads repositories through bare mirror clones under `cache_dir`.
pub struct GitSource {
    cache_dir: PathBuf,
    credentials: HashMap<String, GitAuthSettings>,
    mirror_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitSource {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            credentials: HashMap::new(),
            mirror_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers credentials from Repository resources, keyed by URL.
    pub fn with_repositories<'a>(
        mut self,
        repositories: impl IntoIterator<Item = &'a RepositoryResource>,
    ) -> Self {
        for repo in repositories {
            self.credentials
                .insert(repo.spec.url.clone(), repo.spec.auth.clone());
        }
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Location of the bare mirror for `url`.
    pub fn mirror_path(&self, url: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(url.as_bytes()));
        self.cache_dir.join(format!("{}.git", &digest[..16]))
    }

    fn auth_env(&self, url: &str) -> Result<AuthEnv> {
        match self.credentials.get(url) {
            Some(auth) => build_auth_env(auth),
            None => build_auth_env(&GitAuthSettings::default()),
        }
    }

    fn mirror_lock(&self, url: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.mirror_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(url.to_string()).or_default())
    }

    /// Runs git with the credentials for `url`. The child is killed if the
    /// future is dropped, so callers' deadlines also stop the process.
    async fn run_git(&self, url: &str, cwd: Option<&Path>, args: &[&str]) -> Result<Output> {
        let auth = self.auth_env(url)?;

        let mut cmd = Command::new("git");
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &auth.env_vars {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| GitOpsError::GitOperation(format!("failed to run git: {}", e)))?;
        drop(auth);
        Ok(output)
    }

    async fn run_checked(&self, url: &str, cwd: Option<&Path>, args: &[&str]) -> Result<Output> {
        let output = self.run_git(url, cwd, args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(classify_git_error(&format_git_error(&output)))
        }
    }

    /// Clones the mirror on first use.
    async fn ensure_mirror(&self, url: &str) -> Result<PathBuf> {
        let mirror = self.mirror_path(url);
        if mirror.join("HEAD").exists() {
            return Ok(mirror);
        }
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let target = mirror.to_string_lossy().into_owned();
        log::info!("Cloning {} into {}", url, target);
        self.run_checked(url, None, &["clone", "--bare", "--quiet", url, &target])
            .await?;
        Ok(mirror)
    }

    async fn has_commit(&self, url: &str, mirror: &Path, revision: &RevisionId) -> bool {
        let object = format!("{}^{{commit}}", revision);
        self.run_git(url, Some(mirror), &["cat-file", "-e", &object])
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn fetch(&self, url: &str, mirror: &Path) -> Result<()> {
        log::debug!("Fetching {}", url);
        self.run_checked(
            url,
            Some(mirror),
            &[
                "fetch",
                "--quiet",
                "--prune",
                url,
                "+refs/heads/*:refs/heads/*",
                "+refs/tags/*:refs/tags/*",
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SourceBackend for GitSource {
    async fn resolve(&self, locator: &SourceLocator) -> Result<RevisionId> {
        if is_commit_id(&locator.target_revision) {
            return Ok(RevisionId::new(locator.target_revision.as_str()));
        }

        let output = self
            .run_checked(
                &locator.repo_url,
                None,
                &["ls-remote", &locator.repo_url, &locator.target_revision],
            )
            .await?;
        let listing = String::from_utf8_lossy(&output.stdout);
        parse_ls_remote(&listing, &locator.target_revision)
            .map(RevisionId::new)
            .ok_or_else(|| GitOpsError::RevisionNotFound(locator.target_revision.clone()))
    }

    async fn read_tree(
        &self,
        locator: &SourceLocator,
        revision: &RevisionId,
    ) -> Result<SourceTree> {
        let url = locator.repo_url.as_str();
        let dir = normalize_path(&locator.path)?;

        let lock = self.mirror_lock(url);
        let _guard = lock.lock().await;

        let mirror = self.ensure_mirror(url).await?;
        if !self.has_commit(url, &mirror, revision).await {
            self.fetch(url, &mirror).await?;
            if !self.has_commit(url, &mirror, revision).await {
                return Err(GitOpsError::RevisionNotFound(revision.to_string()));
            }
        }

        let rev = revision.as_str();
        let mut args = vec!["ls-tree", "-r", "-z", "--name-only", rev];
        if !dir.is_empty() {
            args.push("--");
            args.push(&dir);
        }
        let listing = self.run_checked(url, Some(&mirror), &args).await?;

        let mut tree = SourceTree::new();
        for path in parse_ls_tree(&listing.stdout) {
            let Some(relative) = relative_to(&path, &dir) else {
                continue;
            };
            let object = format!("{}:{}", rev, path);
            let blob = self
                .run_checked(url, Some(&mirror), &["show", &object])
                .await?;
            match String::from_utf8(blob.stdout) {
                Ok(contents) => tree.insert(relative, contents),
                Err(_) => log::debug!("Skipping non-UTF-8 file {} at {}", path, revision.short()),
            }
        }
        Ok(tree)
    }
}
