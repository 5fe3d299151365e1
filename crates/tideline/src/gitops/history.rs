//! Sync results and retained snapshots per Application.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::diff::{PatchAction, PatchCause};
use super::manifest::{Manifest, ResourceKey};
use super::policy::SyncTrigger;
use super::snapshot::{DesiredStateSnapshot, RevisionId};

/// Overall outcome of one sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    Error,
}

/// Outcome for one resource within a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ResourceStatus {
    Synced,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceResult {
    pub key: ResourceKey,
    pub action: PatchAction,
    pub cause: PatchCause,
    pub status: ResourceStatus,
    /// Apply calls made, including retries. Zero when skipped.
    pub attempts: u32,
    /// Error class of a failed resource (`ApplyError`, `DiffConflict`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Failure of each unsuccessful attempt, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One sync attempt, recorded whatever its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub id: Uuid,
    pub application: String,
    pub revision: RevisionId,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub resources: Vec<ResourceResult>,
}

impl SyncResult {
    /// Derives the overall status from per-resource outcomes: any error is
    /// `Error`, otherwise any skip (cancellation) is `OutOfSync`.
    pub fn from_resources(
        application: &str,
        revision: RevisionId,
        trigger: SyncTrigger,
        started_at: DateTime<Utc>,
        resources: Vec<ResourceResult>,
    ) -> Self {
        let status = if resources.iter().any(|r| r.status == ResourceStatus::Error) {
            SyncStatus::Error
        } else if resources.iter().any(|r| r.status == ResourceStatus::Skipped) {
            SyncStatus::OutOfSync
        } else {
            SyncStatus::Synced
        };
        Self {
            id: Uuid::new_v4(),
            application: application.to_string(),
            revision,
            trigger,
            started_at,
            finished_at: Utc::now(),
            status,
            resources,
        }
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<&ResourceResult> {
        self.resources.iter().find(|r| &r.key == key)
    }

    pub fn count(&self, status: ResourceStatus) -> usize {
        self.resources.iter().filter(|r| r.status == status).count()
    }
}

/// Bounded per-Application history plus the record of what was last
/// written for each key.
///
/// Snapshots and sync results have separate bounds. Results are append-only
/// until their bound is reached, then the oldest is dropped.
#[derive(Debug, Clone)]
pub struct History {
    limit: usize,
    result_limit: usize,
    snapshots: VecDeque<DesiredStateSnapshot>,
    results: VecDeque<SyncResult>,
    last_applied: BTreeMap<ResourceKey, Manifest>,
}

impl History {
    pub fn new(limit: usize, result_limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            result_limit: result_limit.max(1),
            snapshots: VecDeque::new(),
            results: VecDeque::new(),
            last_applied: BTreeMap::new(),
        }
    }

    /// Retains `snapshot`, replacing an older copy of the same revision.
    pub fn retain_snapshot(&mut self, snapshot: DesiredStateSnapshot) {
        self.snapshots
            .retain(|s| s.revision() != snapshot.revision());
        self.snapshots.push_back(snapshot);
        while self.snapshots.len() > self.limit {
            self.snapshots.pop_front();
        }
    }

    pub fn snapshot(&self, revision: &RevisionId) -> Option<&DesiredStateSnapshot> {
        self.snapshots.iter().find(|s| s.revision() == revision)
    }

    /// Retained revisions, oldest first.
    pub fn revisions(&self) -> Vec<RevisionId> {
        self.snapshots.iter().map(|s| s.revision().clone()).collect()
    }

    pub fn push_result(&mut self, result: SyncResult) {
        self.results.push_back(result);
        while self.results.len() > self.result_limit {
            self.results.pop_front();
        }
    }

    /// Sync results, oldest first.
    pub fn results(&self) -> impl Iterator<Item = &SyncResult> {
        self.results.iter()
    }

    pub fn last_result(&self) -> Option<&SyncResult> {
        self.results.back()
    }

    pub fn record_applied(&mut self, manifest: Manifest) {
        self.last_applied.insert(manifest.key(), manifest);
    }

    pub fn forget_applied(&mut self, key: &ResourceKey) {
        self.last_applied.remove(key);
    }

    pub fn last_applied(&self) -> &BTreeMap<ResourceKey, Manifest> {
        &self.last_applied
    }
}
