pub mod config;
pub mod engine;
pub mod error;
pub mod gitops;
pub mod logging;
pub mod secrets;

pub use config::EngineSettings;
pub use engine::{default_source, Engine};
pub use error::{Result, TidelineError};
pub use gitops::{
    ApplicationResource, ClusterApi, ConfigLoader, GitOpsError, LoadedConfig, MemoryCluster,
    MemorySource, ReconcileError, ReconcileOutcome, Reconciler, SourceBackend, StatusView,
    SyncScheduler, SyncTrigger,
};
pub use secrets::{resolve_secret, SecretError};
