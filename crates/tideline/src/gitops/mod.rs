//! GitOps reconciliation.
//!
//! - Kubernetes-style configuration resources (Settings, Application, Repository)
//! - Source watching over git, local directories and in-memory repositories
//! - Chart rendering into immutable desired-state snapshots
//! - Field-level diffing, ordered sync with retries and cancellation
//! - Per-Application status, health and history

pub mod cluster;
pub mod diff;
pub mod error;
pub mod events;
pub mod executor;
pub mod git;
pub mod health;
pub mod history;
pub mod loader;
pub mod manifest;
pub mod policy;
pub mod reconciler;
pub mod render;
pub mod resource;
pub mod snapshot;
pub mod source;
pub mod status;
pub mod sync_scheduler;
pub mod validation;
pub mod watcher;

pub use cluster::{ClusterApi, ClusterError, LabelSelector, LiveResource, MemoryCluster};
pub use diff::{diff, DiffOptions, DiffResult, Patch, PatchAction, PatchCause};
pub use error::{GitOpsError, ReconcileError, Result};
pub use events::{ApplicationEvent, ApplicationEventKind, EventBroadcaster};
pub use executor::{CancelFlag, ExecutorOptions, SyncExecutor};
pub use git::GitSource;
pub use health::HealthStatus;
pub use history::{ResourceResult, ResourceStatus, SyncResult, SyncStatus};
pub use loader::{ConfigLoader, LoadedConfig};
pub use manifest::{Manifest, ResourceKey, INSTANCE_LABEL, SYNC_WAVE_ANNOTATION};
pub use policy::{SyncDecision, SyncTrigger};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use render::{render_source, Release, RenderError};
pub use resource::{
    AnyResource, ApplicationDestination, ApplicationResource, ApplicationSource, ApplicationSpec,
    GitAuthSettings, GitAuthType, ObjectMeta, RepositoryResource, RepositorySpec, Resource,
    ResourceKind, ResourceWithPath, RetryPolicy, SettingsResource, SyncMode, SyncPolicy,
    API_VERSION,
};
pub use snapshot::{DesiredStateSnapshot, RevisionId};
pub use source::{DirectorySource, MemorySource, SourceBackend, SourceLocator, SourceTree};
pub use status::{ApplicationStatus, Condition, ConditionKind, StatusView, SyncPhase};
pub use sync_scheduler::SyncScheduler;
pub use validation::ConfigValidator;
pub use watcher::{ChangeNotifier, SourceChangeEvent, SourceWatcher};
