//! K8s-style resource types for declaring Applications and their sources.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::EngineSettings;

/// The API version for all tideline resources.
pub const API_VERSION: &str = "tideline.io/v1";

/// The kind of resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Settings,
    Application,
    Repository,
}

impl ResourceKind {
    /// Returns all resource kinds.
    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::Settings,
            ResourceKind::Application,
            ResourceKind::Repository,
        ]
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Settings => write!(f, "Settings"),
            ResourceKind::Application => write!(f, "Application"),
            ResourceKind::Repository => write!(f, "Repository"),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "settings" => Ok(ResourceKind::Settings),
            "application" => Ok(ResourceKind::Application),
            "repository" => Ok(ResourceKind::Repository),
            _ => Err(format!("Unknown resource kind: {}", s)),
        }
    }
}

/// Metadata for a resource, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// The unique name of the resource within its kind.
    pub name: String,

    /// Key-value labels for organizing and selecting resources.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    /// Key-value annotations for storing additional metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl ObjectMeta {
    /// Creates a new ObjectMeta with just a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    /// Adds a label to the metadata.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A generic K8s-style resource wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource<T> {
    /// API version, should always be `tideline.io/v1`.
    pub api_version: String,

    /// The kind of resource.
    pub kind: ResourceKind,

    /// Resource metadata.
    pub metadata: ObjectMeta,

    /// The resource specification.
    pub spec: T,
}

impl<T> Resource<T> {
    /// Creates a new resource with the given kind and spec.
    pub fn new(kind: ResourceKind, name: impl Into<String>, spec: T) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind,
            metadata: ObjectMeta::new(name),
            spec,
        }
    }

    /// Returns the name of the resource.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Type alias for the engine Settings resource.
pub type SettingsResource = Resource<EngineSettings>;

// ============================================================================
// Application Resource
// ============================================================================

/// Application specification: where desired state comes from and where it goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Configuration source.
    pub source: ApplicationSource,

    /// Target cluster and namespace.
    pub destination: ApplicationDestination,

    /// How and when to converge.
    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

/// Locates the chart for an Application inside a versioned source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    /// Repository URL: a git URL, a `file://` directory, or an in-memory repository name.
    pub repo_url: String,

    /// Chart directory inside the repository.
    #[serde(default = "default_source_path")]
    pub path: String,

    /// Branch, tag or commit to track.
    #[serde(default = "default_target_revision")]
    pub target_revision: String,

    /// Value files relative to `path`, merged in order after `values.yaml`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_files: Vec<String>,

    /// Inline values, merged last.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub values: serde_json::Value,
}

fn default_source_path() -> String {
    ".".to_string()
}

fn default_target_revision() -> String {
    "HEAD".to_string()
}

/// Target of an Application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    /// Cluster name.
    #[serde(default = "default_server")]
    pub server: String,

    /// Namespace for namespaced resources that do not declare one.
    pub namespace: String,
}

fn default_server() -> String {
    "in-cluster".to_string()
}

/// Whether reconciliation may write to the cluster without an operator command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Manual,
    Automatic,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Manual => write!(f, "manual"),
            SyncMode::Automatic => write!(f, "automatic"),
        }
    }
}

/// Per-Application sync policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Automatic or manual sync.
    #[serde(default)]
    pub mode: SyncMode,

    /// Delete owned live resources that are no longer declared.
    #[serde(default)]
    pub prune: bool,

    /// Revert changes made to live resources outside the source.
    #[serde(default)]
    pub self_heal: bool,

    /// Apply retry budget; engine defaults when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Refresh interval override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval_secs: Option<u64>,
}

/// Retry budget for transient apply failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub limit: u32,

    /// Base backoff in milliseconds, doubled per retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    1000
}

/// Type alias for Application resource.
pub type ApplicationResource = Resource<ApplicationSpec>;

// ============================================================================
// Repository Resource
// ============================================================================

/// Credentials and fetch settings for a git repository URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// Repository URL this entry applies to.
    pub url: String,

    /// Authentication settings.
    #[serde(default)]
    pub auth: GitAuthSettings,
}

/// Git authentication settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAuthSettings {
    /// Authentication type: none, token, or ssh-key.
    #[serde(default, rename = "type")]
    pub auth_type: GitAuthType,

    /// Environment variable containing the token.
    #[serde(default)]
    pub token_env_var: String,

    /// Direct token value (for local development).
    /// WARNING: This stores the token in plaintext in the config file.
    /// Prefer token_env_var or token_file for better security.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "token")]
    pub token_insecure: Option<String>,

    /// Path to file containing the token (for mounted secrets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    /// Path to SSH key file.
    #[serde(default)]
    pub ssh_key_path: String,
}

/// Git authentication type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitAuthType {
    #[default]
    None,
    Token,
    SshKey,
}

/// Type alias for Repository resource.
pub type RepositoryResource = Resource<RepositorySpec>;

// ============================================================================
// Any Resource (for generic handling)
// ============================================================================

/// A resource that can be any of the supported types.
///
/// Parsed by dispatching on [`ResourceHeader::kind`], never by trial.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
#[allow(clippy::large_enum_variant)]
pub enum AnyResource {
    Settings(SettingsResource),
    Application(ApplicationResource),
    Repository(RepositoryResource),
}

impl AnyResource {
    /// Returns the kind of this resource.
    pub fn kind(&self) -> ResourceKind {
        match self {
            AnyResource::Settings(_) => ResourceKind::Settings,
            AnyResource::Application(_) => ResourceKind::Application,
            AnyResource::Repository(_) => ResourceKind::Repository,
        }
    }

    /// Returns the name of this resource.
    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Returns the metadata of this resource.
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            AnyResource::Settings(r) => &r.metadata,
            AnyResource::Application(r) => &r.metadata,
            AnyResource::Repository(r) => &r.metadata,
        }
    }
}

/// Intermediate struct for parsing resources before determining their type.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHeader {
    pub api_version: String,
    pub kind: ResourceKind,
    pub metadata: ObjectMeta,
}

/// A resource along with its file path.
#[derive(Debug, Clone)]
pub struct ResourceWithPath<T> {
    /// The resource.
    pub resource: T,
    /// The file path relative to the config directory.
    pub path: std::path::PathBuf,
}

impl<T> ResourceWithPath<T> {
    pub fn new(resource: T, path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            resource,
            path: path.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
