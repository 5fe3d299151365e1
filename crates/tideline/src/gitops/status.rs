//! Application sync state machine and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ReconcileError;
use super::health::HealthStatus;
use super::history::SyncResult;
use super::policy::SyncTrigger;
use super::snapshot::RevisionId;

/// Sync state of an Application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SyncPhase {
    Unknown,
    OutOfSync,
    Syncing,
    Synced,
    Error,
}

impl SyncPhase {
    /// States reachable from `self` in one step. Staying put is always allowed.
    pub fn allowed_transitions(&self) -> &'static [SyncPhase] {
        use SyncPhase::*;
        match self {
            Unknown => &[OutOfSync, Synced, Error],
            OutOfSync => &[Syncing, Synced, Error],
            Syncing => &[Synced, Error, OutOfSync],
            Synced => &[OutOfSync],
            Error => &[Syncing, OutOfSync, Synced],
        }
    }

    pub fn can_transition_to(&self, next: SyncPhase) -> bool {
        *self == next || self.allowed_transitions().contains(&next)
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Unknown => write!(f, "Unknown"),
            SyncPhase::OutOfSync => write!(f, "OutOfSync"),
            SyncPhase::Syncing => write!(f, "Syncing"),
            SyncPhase::Synced => write!(f, "Synced"),
            SyncPhase::Error => write!(f, "Error"),
        }
    }
}

/// Rejects transitions the state machine does not allow.
pub fn validate_transition(from: SyncPhase, to: SyncPhase) -> Result<(), ReconcileError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ReconcileError::Validation(format!(
            "illegal sync transition {} -> {}",
            from, to
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionKind {
    SourceUnavailable,
    RenderError,
    SyncError,
    DiffConflict,
    DriftDetected,
    OrphanedResources,
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConditionKind::SourceUnavailable => "SourceUnavailable",
            ConditionKind::RenderError => "RenderError",
            ConditionKind::SyncError => "SyncError",
            ConditionKind::DiffConflict => "DiffConflict",
            ConditionKind::DriftDetected => "DriftDetected",
            ConditionKind::OrphanedResources => "OrphanedResources",
        };
        f.write_str(name)
    }
}

/// An operator-visible problem. At most one condition per kind is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub kind: ConditionKind,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

/// The sync currently running for an Application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    pub id: Uuid,
    pub trigger: SyncTrigger,
    pub revision: RevisionId,
    pub started_at: DateTime<Utc>,
}

/// Runtime status of an Application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    pub phase: SyncPhase,
    pub health: HealthStatus,
    /// Revision of the snapshot last synced to the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_revision: Option<RevisionId>,
    /// Revision last resolved from the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_revision: Option<RevisionId>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub consecutive_source_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl Default for ApplicationStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Unknown,
            health: HealthStatus::Unknown,
            last_revision: None,
            observed_revision: None,
            conditions: Vec::new(),
            consecutive_source_failures: 0,
            operation: None,
            reconciled_at: None,
        }
    }
}

impl ApplicationStatus {
    /// Moves to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: SyncPhase) -> Result<(), ReconcileError> {
        validate_transition(self.phase, next)?;
        if self.phase != next {
            log::debug!("Sync phase {} -> {}", self.phase, next);
            self.phase = next;
        }
        Ok(())
    }

    /// Sets or replaces the condition of `kind`. The transition time only
    /// moves when the message changes.
    pub fn set_condition(&mut self, kind: ConditionKind, message: impl Into<String>) {
        let message = message.into();
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(existing) if existing.message == message => {}
            Some(existing) => {
                existing.message = message;
                existing.last_transition = Utc::now();
            }
            None => self.conditions.push(Condition {
                kind,
                message,
                last_transition: Utc::now(),
            }),
        }
    }

    pub fn clear_condition(&mut self, kind: ConditionKind) {
        self.conditions.retain(|c| c.kind != kind);
    }

    pub fn condition(&self, kind: ConditionKind) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }
}

/// Answer to `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub name: String,
    pub health: HealthStatus,
    pub sync_status: SyncPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_revision: Option<RevisionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_revision: Option<RevisionId>,
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<SyncResult>,
}
