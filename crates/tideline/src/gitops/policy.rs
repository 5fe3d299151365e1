//! The single point where sync policy turns a diff into an action.

use serde::{Deserialize, Serialize};

use super::diff::DiffResult;
use super::error::ReconcileError;
use super::resource::{SyncMode, SyncPolicy};

/// What started a reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
    /// Periodic poll, change notification or operator refresh.
    Refresh,
    /// A request to sync automatically, e.g. from a webhook.
    Automated,
    /// Operator `sync` command.
    Manual,
    /// Operator `rollback` command.
    Rollback,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncTrigger::Refresh => write!(f, "refresh"),
            SyncTrigger::Automated => write!(f, "automated"),
            SyncTrigger::Manual => write!(f, "manual"),
            SyncTrigger::Rollback => write!(f, "rollback"),
        }
    }
}

/// Outcome of [`SyncPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Run the executor over the patches.
    Apply,
    /// Record OutOfSync and write nothing.
    ReportOnly,
    /// Desired and live agree.
    Noop,
}

impl SyncPolicy {
    /// Whether drift should be emitted as patches for this trigger.
    ///
    /// Operator commands always revert drift; otherwise the Application's
    /// own `selfHeal` applies.
    pub fn heals_drift(&self, trigger: SyncTrigger) -> bool {
        match trigger {
            SyncTrigger::Manual | SyncTrigger::Rollback => true,
            SyncTrigger::Refresh | SyncTrigger::Automated => self.self_heal,
        }
    }

    /// Rejects triggers the policy never accepts, before any work is done.
    ///
    /// An automated trigger against a manual Application, and a rollback of
    /// an automatic one (which would roll forward again on the next poll),
    /// are policy violations and must not change any state.
    pub fn admits(&self, application: &str, trigger: SyncTrigger) -> Result<(), ReconcileError> {
        let reason = match (trigger, self.mode) {
            (SyncTrigger::Automated, SyncMode::Manual) => {
                "automatic sync requested for an application with manual sync policy"
            }
            (SyncTrigger::Rollback, SyncMode::Automatic) => {
                "rollback requires a manual sync policy"
            }
            _ => return Ok(()),
        };
        Err(ReconcileError::PolicyViolation {
            application: application.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Decides what to do with `diff`.
    pub fn decide(
        &self,
        application: &str,
        trigger: SyncTrigger,
        diff: &DiffResult,
    ) -> Result<SyncDecision, ReconcileError> {
        self.admits(application, trigger)?;
        let may_apply = !(trigger == SyncTrigger::Refresh && self.mode == SyncMode::Manual);

        Ok(if may_apply && diff.has_patches() {
            SyncDecision::Apply
        } else if diff.is_in_sync() {
            SyncDecision::Noop
        } else {
            SyncDecision::ReportOnly
        })
    }
}
