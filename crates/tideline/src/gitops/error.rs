//! GitOps-specific error types.

use std::path::PathBuf;
use thiserror::Error;

use super::cluster::ClusterError;
use super::render::RenderError;
use super::manifest::ResourceKey;

/// Errors that can occur while loading configuration or talking to a git source.
#[derive(Error, Debug)]
pub enum GitOpsError {
    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid API version '{version}', expected '{expected}'")]
    InvalidApiVersion { version: String, expected: String },

    #[error("Duplicate resource name '{name}' for kind '{kind}'")]
    DuplicateName { kind: String, name: String },

    #[error("File operation failed: {0}")]
    FileOperation(String),

    #[error("Git operation failed: {0}")]
    GitOperation(String),

    #[error("Git network error: {0}")]
    GitNetworkError(String),

    #[error("Git operation timed out after {0}s")]
    GitTimeout(u64),

    #[error("Git authentication failed: {0}")]
    GitAuthFailed(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Revision '{0}' not found")]
    RevisionNotFound(String),

    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("Config directory not found: {0}")]
    ConfigDirNotFound(PathBuf),

    #[error("Path traversal detected: {0}")]
    PathTraversal(String),
}

impl From<serde_yaml::Error> for GitOpsError {
    fn from(err: serde_yaml::Error) -> Self {
        GitOpsError::ParseYaml {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for GitOpsError {
    fn from(err: std::io::Error) -> Self {
        GitOpsError::FileOperation(err.to_string())
    }
}

impl GitOpsError {
    /// Returns true if the error is likely transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GitOpsError::GitNetworkError(_)
                | GitOpsError::GitTimeout(_)
                | GitOpsError::SourceUnavailable(_)
        )
    }
}

/// Classifies a git stderr string into a more specific error variant.
pub fn classify_git_error(stderr: &str) -> GitOpsError {
    let lower = stderr.to_lowercase();

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return GitOpsError::GitNetworkError(stderr.trim().to_string());
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
    {
        return GitOpsError::GitAuthFailed(stderr.trim().to_string());
    }

    GitOpsError::GitOperation(stderr.trim().to_string())
}

/// Result type for configuration and git operations.
pub type Result<T> = std::result::Result<T, GitOpsError>;

/// Errors surfaced by a reconciliation cycle or an operator command.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Source '{locator}' unavailable after {attempts} attempt(s): {message}")]
    SourceUnavailable {
        locator: String,
        attempts: u32,
        message: String,
    },

    #[error("Render failed: {0}")]
    Render(#[from] RenderError),

    #[error("Conflicting concurrent modification of {key}: {message}")]
    DiffConflict { key: ResourceKey, message: String },

    #[error("Failed to apply {key}: {source}")]
    Apply {
        key: ResourceKey,
        #[source]
        source: ClusterError,
    },

    #[error("Policy violation for application '{application}': {reason}")]
    PolicyViolation { application: String, reason: String },

    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    #[error("Application already registered: {0}")]
    ApplicationExists(String),

    #[error("Revision '{revision}' is not retained in the history of '{application}'")]
    RevisionNotFound {
        application: String,
        revision: String,
    },

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Invalid application: {0}")]
    Validation(String),
}

impl ReconcileError {
    /// Returns true for transient classes that are retried internally.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::SourceUnavailable { .. } | ReconcileError::DiffConflict { .. } => true,
            ReconcileError::Apply { source, .. } | ReconcileError::Cluster(source) => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// Short machine-readable reason used in status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::SourceUnavailable { .. } => "SourceUnavailable",
            ReconcileError::Render(_) => "RenderError",
            ReconcileError::DiffConflict { .. } => "DiffConflict",
            ReconcileError::Apply { .. } => "ApplyError",
            ReconcileError::PolicyViolation { .. } => "PolicyViolation",
            ReconcileError::ApplicationNotFound(_) => "ApplicationNotFound",
            ReconcileError::ApplicationExists(_) => "ApplicationExists",
            ReconcileError::RevisionNotFound { .. } => "RevisionNotFound",
            ReconcileError::Cluster(_) => "ClusterError",
            ReconcileError::Validation(_) => "InvalidSpec",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_network_error() {
        let err = classify_git_error("fatal: Could not resolve host: github.com");
        assert!(matches!(err, GitOpsError::GitNetworkError(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_auth_error() {
        let err = classify_git_error("remote: Authentication failed for 'https://x'");
        assert!(matches!(err, GitOpsError::GitAuthFailed(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_other_error() {
        let err = classify_git_error("  fatal: bad revision 'nope'  ");
        match err {
            GitOpsError::GitOperation(msg) => assert_eq!(msg, "fatal: bad revision 'nope'"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_reconcile_error_retryable() {
        let unavailable = ReconcileError::SourceUnavailable {
            locator: "repo".to_string(),
            attempts: 4,
            message: "timeout".to_string(),
        };
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.reason(), "SourceUnavailable");

        let policy = ReconcileError::PolicyViolation {
            application: "web".to_string(),
            reason: "manual".to_string(),
        };
        assert!(!policy.is_retryable());

        let transient = ReconcileError::Cluster(ClusterError::Unavailable("down".to_string()));
        assert!(transient.is_retryable());
        let fatal = ReconcileError::Cluster(ClusterError::Invalid("bad schema".to_string()));
        assert!(!fatal.is_retryable());
    }
}
