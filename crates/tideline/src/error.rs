use thiserror::Error;

use crate::gitops::cluster::ClusterError;
use crate::gitops::error::{GitOpsError, ReconcileError};
use crate::gitops::render::RenderError;
use crate::secrets::SecretError;

/// Any error the engine can surface to its embedder.
#[derive(Error, Debug)]
pub enum TidelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] GitOpsError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Credential error: {0}")]
    Secret(#[from] SecretError),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, TidelineError>;
