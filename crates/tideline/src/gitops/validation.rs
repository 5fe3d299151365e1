//! Cross-resource validation for engine configuration.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

// DNS-1123 label: lowercase alphanumerics and '-', starting and ending alphanumeric.
static RE_DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

const MAX_NAME_LEN: usize = 63;

use super::error::{GitOpsError, Result};
use super::loader::LoadedConfig;
use super::resource::{
    ApplicationResource, GitAuthType, RepositoryResource, SyncMode, API_VERSION,
};
use crate::config::{MAX_BACKOFF_MS, MAX_RETRY_LIMIT};
use crate::secrets::has_secret_source;

/// Validator for loaded configuration.
pub struct ConfigValidator {
    /// Collected validation errors.
    errors: Vec<String>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Validates the whole configuration, collecting every problem before failing.
    pub fn validate(&mut self, config: &LoadedConfig) -> Result<()> {
        self.errors.clear();

        for problem in config.settings.validate() {
            self.errors.push(format!("Settings: {}", problem));
        }

        for app in &config.applications {
            self.errors.extend(validate_application(&app.resource));
        }

        for repo in &config.repositories {
            self.validate_repository(&repo.resource);
        }

        self.validate_unique_names(config);

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(GitOpsError::Validation(self.errors.join("; ")))
        }
    }

    fn validate_repository(&mut self, repo: &RepositoryResource) {
        let name = repo.name();
        if repo.spec.url.trim().is_empty() {
            self.errors
                .push(format!("Repository '{}': url must not be empty", name));
        }
        let auth = &repo.spec.auth;
        match auth.auth_type {
            GitAuthType::Token
                if !has_secret_source(
                    auth.token_insecure.as_deref(),
                    auth.token_file.as_deref(),
                    Some(auth.token_env_var.as_str()),
                ) =>
            {
                self.errors.push(format!(
                    "Repository '{}': token auth requires tokenEnvVar, tokenFile or token",
                    name
                ));
            }
            GitAuthType::SshKey if auth.ssh_key_path.is_empty() => {
                self.errors.push(format!(
                    "Repository '{}': ssh-key auth requires sshKeyPath",
                    name
                ));
            }
            _ => {}
        }
    }

    fn validate_unique_names(&mut self, config: &LoadedConfig) {
        let mut app_names: HashSet<&str> = HashSet::new();
        for app in &config.applications {
            let name = app.resource.name();
            if !app_names.insert(name) {
                self.errors
                    .push(format!("Duplicate application name: '{}'", name));
            }
        }

        let mut repo_urls: HashSet<&str> = HashSet::new();
        for repo in &config.repositories {
            let url = repo.resource.spec.url.as_str();
            if !repo_urls.insert(url) {
                self.errors
                    .push(format!("Duplicate repository url: '{}'", url));
            }
        }
    }

    /// Returns the collected errors.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks a single Application, returning one message per problem.
pub fn validate_application(app: &ApplicationResource) -> Vec<String> {
    let mut errors = Vec::new();
    let name = app.name();
    let label = format!("Application '{}'", name);

    if app.api_version != API_VERSION {
        errors.push(format!(
            "{}: apiVersion must be '{}', got '{}'",
            label, API_VERSION, app.api_version
        ));
    }
    if !is_dns_label(name) {
        errors.push(format!(
            "{}: name must be a DNS-1123 label (lowercase alphanumerics and '-', at most {} characters)",
            label, MAX_NAME_LEN
        ));
    }

    let source = &app.spec.source;
    if source.repo_url.trim().is_empty() {
        errors.push(format!("{}: source.repoUrl must not be empty", label));
    }
    if source.target_revision.trim().is_empty() {
        errors.push(format!("{}: source.targetRevision must not be empty", label));
    }
    check_relative_path(&mut errors, &source.path, &label, "source.path");
    for (i, file) in source.value_files.iter().enumerate() {
        check_relative_path(&mut errors, file, &label, &format!("source.valueFiles[{}]", i));
    }
    if !(source.values.is_null() || source.values.is_object()) {
        errors.push(format!("{}: source.values must be a mapping", label));
    }

    let destination = &app.spec.destination;
    if destination.namespace.trim().is_empty() {
        errors.push(format!("{}: destination.namespace must not be empty", label));
    } else if !is_dns_label(&destination.namespace) {
        errors.push(format!(
            "{}: destination.namespace '{}' is not a DNS-1123 label",
            label, destination.namespace
        ));
    }

    let policy = &app.spec.sync_policy;
    if policy.refresh_interval_secs == Some(0) {
        errors.push(format!(
            "{}: syncPolicy.refreshIntervalSecs must be greater than 0",
            label
        ));
    }
    if let Some(retry) = &policy.retry {
        if retry.limit > MAX_RETRY_LIMIT {
            errors.push(format!(
                "{}: syncPolicy.retry.limit must be at most {}",
                label, MAX_RETRY_LIMIT
            ));
        }
        if retry.backoff_ms > MAX_BACKOFF_MS {
            errors.push(format!(
                "{}: syncPolicy.retry.backoffMs must be at most {}",
                label, MAX_BACKOFF_MS
            ));
        }
    }
    if policy.self_heal && policy.mode == SyncMode::Manual {
        log::warn!(
            "{}: selfHeal only takes effect on operator syncs while mode is manual",
            label
        );
    }

    errors
}

fn is_dns_label(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN && RE_DNS_LABEL.is_match(name)
}

fn check_relative_path(errors: &mut Vec<String>, path: &str, resource: &str, field: &str) {
    if contains_path_traversal(path) {
        errors.push(format!(
            "Path traversal detected in {}.{}: '{}'",
            resource, field, path
        ));
    }
    if path.starts_with('/') || std::path::Path::new(path).is_absolute() {
        errors.push(format!(
            "Absolute path not allowed in {}.{}: paths are relative to the repository",
            resource, field
        ));
    }
}

/// Checks if a path could escape its base directory.
fn contains_path_traversal(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}
