//! Applies ordered patches to the cluster.
//!
//! Each patch gets its own retry budget and deadline. A failure is scoped
//! to its resource: later patches still run. Cancellation is checked
//! between patches only, so a resource is never left half-applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::cluster::{ClusterApi, ClusterError, ClusterResult};
use super::diff::{Patch, PatchAction};
use super::error::ReconcileError;
use super::history::{ResourceResult, ResourceStatus};
use super::resource::RetryPolicy;
use crate::config::EngineSettings;

/// Shared flag that stops a running sync after the current resource.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Deadline and retry budget for cluster writes.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub apply_timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ExecutorOptions {
    /// Engine defaults, overridden by an Application's own retry policy.
    pub fn resolve(settings: &EngineSettings, retry: Option<&RetryPolicy>) -> Self {
        let (max_retries, base_delay_ms) = match retry {
            Some(policy) => (policy.limit, policy.backoff_ms),
            None => (settings.retry.max_retries, settings.retry.base_delay_ms),
        };
        Self {
            apply_timeout: Duration::from_secs(settings.apply_timeout_secs),
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(settings.retry.max_delay_ms),
        }
    }
}

/// Delay before retry number `attempt` (1-based): `base` doubled per retry,
/// never more than `max`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    2u32.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Outcome of one executor run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// One entry per patch, in apply order.
    pub resources: Vec<ResourceResult>,
    pub cancelled: bool,
}

impl ExecutionReport {
    /// Patches whose write went through.
    pub fn applied<'a>(&'a self, patches: &'a [Patch]) -> impl Iterator<Item = &'a Patch> {
        patches
            .iter()
            .zip(&self.resources)
            .filter(|(_, r)| r.status == ResourceStatus::Synced)
            .map(|(p, _)| p)
    }
}

pub struct SyncExecutor {
    cluster: Arc<dyn ClusterApi>,
}

impl SyncExecutor {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Applies `patches` in order until done or cancelled.
    pub async fn execute(
        &self,
        patches: &[Patch],
        options: &ExecutorOptions,
        cancel: &CancelFlag,
    ) -> ExecutionReport {
        let mut resources = Vec::with_capacity(patches.len());
        let mut cancelled = false;

        for patch in patches {
            if cancelled || cancel.is_cancelled() {
                if !cancelled {
                    log::info!("Sync cancelled before {} {}", patch.action, patch.key);
                }
                cancelled = true;
                resources.push(ResourceResult {
                    key: patch.key.clone(),
                    action: patch.action,
                    cause: patch.cause,
                    status: ResourceStatus::Skipped,
                    attempts: 0,
                    reason: None,
                    errors: Vec::new(),
                    message: Some("superseded by a newer revision".to_string()),
                });
                continue;
            }
            resources.push(self.apply_with_retry(patch, options).await);
        }

        ExecutionReport {
            resources,
            cancelled,
        }
    }

    async fn apply_with_retry(&self, patch: &Patch, options: &ExecutorOptions) -> ResourceResult {
        let mut errors = Vec::new();
        let mut attempt: u32 = 0;

        let failure = loop {
            attempt += 1;
            let result = match tokio::time::timeout(options.apply_timeout, self.apply_once(patch)).await {
                Ok(result) => result,
                Err(_) => Err(ClusterError::Timeout(options.apply_timeout.as_millis() as u64)),
            };

            match result {
                Ok(()) => {
                    log::debug!("Applied {} {} (attempt {})", patch.action, patch.key, attempt);
                    return ResourceResult {
                        key: patch.key.clone(),
                        action: patch.action,
                        cause: patch.cause,
                        status: ResourceStatus::Synced,
                        attempts: attempt,
                        reason: None,
                        errors,
                        message: None,
                    };
                }
                Err(e) if e.is_transient() && attempt <= options.max_retries => {
                    errors.push(e.to_string());
                    // A conflict is resolved by the fresh read at the top of the
                    // next attempt; only unavailability backs off.
                    if !matches!(e, ClusterError::Conflict { .. }) {
                        let delay = backoff_delay(options.base_delay, attempt, options.max_delay);
                        log::warn!(
                            "Apply of {} failed (attempt {}/{}), retrying in {:?}: {}",
                            patch.key,
                            attempt,
                            options.max_retries + 1,
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        log::info!("Conflict on {}, retrying with a fresh read", patch.key);
                    }
                }
                Err(e) => {
                    errors.push(e.to_string());
                    break e;
                }
            }
        };

        let error = match &failure {
            ClusterError::Conflict { .. } => ReconcileError::DiffConflict {
                key: patch.key.clone(),
                message: failure.to_string(),
            },
            _ => ReconcileError::Apply {
                key: patch.key.clone(),
                source: failure.clone(),
            },
        };
        log::error!("{}", error);
        ResourceResult {
            key: patch.key.clone(),
            action: patch.action,
            cause: patch.cause,
            status: ResourceStatus::Error,
            attempts: attempt,
            reason: Some(error.reason().to_string()),
            errors,
            message: Some(error.to_string()),
        }
    }

    /// One write, reading the current version first so a retry never
    /// reuses a stale one. Re-applying a patch that already landed leaves the
    /// object unchanged.
    async fn apply_once(&self, patch: &Patch) -> ClusterResult<()> {
        let current = self.cluster.get(&patch.key).await?;
        match (patch.action, current) {
            (PatchAction::Delete, None) => Ok(()),
            (PatchAction::Delete, Some(live)) => {
                match self
                    .cluster
                    .delete(&patch.key, Some(&live.resource_version))
                    .await
                {
                    Err(ClusterError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
            // Another writer may create or delete the object between the read
            // and the write. Both are conflicts, resolved by the next read.
            (PatchAction::Create | PatchAction::Update, None) => {
                match self.cluster.create(&patch.manifest).await {
                    Ok(_) => Ok(()),
                    Err(ClusterError::AlreadyExists(key)) => Err(ClusterError::Conflict {
                        key,
                        expected: "absent".to_string(),
                        actual: "exists".to_string(),
                    }),
                    Err(e) => Err(e),
                }
            }
            (PatchAction::Create | PatchAction::Update, Some(live)) => {
                match self.cluster.update(&patch.manifest, &live.resource_version).await {
                    Ok(_) => Ok(()),
                    Err(ClusterError::NotFound(key)) => Err(ClusterError::Conflict {
                        key,
                        expected: live.resource_version.clone(),
                        actual: "deleted".to_string(),
                    }),
                    Err(e) => Err(e),
                }
            }
        }
    }
}
