//! Desired vs. live comparison.
//!
//! [`diff`] is pure: it reads a snapshot, a view of the cluster and the
//! manifests last written for each key, and returns ordered patches plus
//! what it chose not to act on (drift without self-heal, orphans without
//! prune).

use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cluster::LiveResource;
use super::manifest::{kind_weight, Manifest, ResourceKey};
use super::snapshot::DesiredStateSnapshot;

/// Metadata fields owned by the cluster, ignored when comparing.
const SERVER_MANAGED_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchAction {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for PatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchAction::Create => write!(f, "create"),
            PatchAction::Update => write!(f, "update"),
            PatchAction::Delete => write!(f, "delete"),
        }
    }
}

/// Why a patch exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchCause {
    /// Never applied before.
    FirstProvision,
    /// The desired manifest changed since it was last applied.
    SourceChange,
    /// The desired manifest is unchanged but the live object is not.
    Drift,
    /// Owned by the Application but no longer declared.
    Orphaned,
}

/// Apply order: sync wave, kind weight, namespace, name, kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRank {
    pub wave: i32,
    pub weight: u8,
    pub namespace: String,
    pub name: String,
    pub kind: String,
}

impl PatchRank {
    pub fn of(manifest: &Manifest) -> Self {
        Self {
            wave: manifest.sync_wave(),
            weight: kind_weight(manifest.kind()),
            namespace: manifest.namespace().to_string(),
            name: manifest.name().to_string(),
            kind: manifest.kind().to_string(),
        }
    }
}

impl Ord for PatchRank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wave
            .cmp(&other.wave)
            .then(self.weight.cmp(&other.weight))
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for PatchRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One write the executor should perform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub action: PatchAction,
    pub key: ResourceKey,
    /// Full desired object for create/update; the live object for delete.
    pub manifest: Manifest,
    /// RFC 6902 operations from normalised live to desired. Empty for creates and deletes.
    pub operations: json_patch::Patch,
    pub cause: PatchCause,
    pub rank: PatchRank,
}

/// A live object that diverged from an unchanged desired manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftItem {
    pub key: ResourceKey,
    /// The object was deleted out of band.
    pub live_missing: bool,
    pub operations: json_patch::Patch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub patches: Vec<Patch>,
    pub drift: Vec<DriftItem>,
    pub orphans: Vec<ResourceKey>,
}

impl DiffResult {
    /// Desired and live agree and nothing is left over.
    pub fn is_in_sync(&self) -> bool {
        self.patches.is_empty() && self.drift.is_empty() && self.orphans.is_empty()
    }

    pub fn has_patches(&self) -> bool {
        !self.patches.is_empty()
    }

    pub fn count(&self, action: PatchAction) -> usize {
        self.patches.iter().filter(|p| p.action == action).count()
    }
}

/// Per-Application switches and history for one diff.
#[derive(Debug, Clone, Copy)]
pub struct DiffOptions<'a> {
    /// Owning Application; only live objects labelled with it can be orphans.
    pub application: &'a str,
    pub prune: bool,
    pub self_heal: bool,
    /// Manifest last written per key.
    pub last_applied: &'a BTreeMap<ResourceKey, Manifest>,
}

/// Removes status and server-managed metadata from a live object.
pub fn normalize_live(object: &Value) -> Value {
    let mut normalized = object.clone();
    if let Some(map) = normalized.as_object_mut() {
        map.remove("status");
        if let Some(meta) = map.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_MANAGED_METADATA {
                meta.remove(*field);
            }
        }
    }
    normalized
}

/// Computes the patches that move `live` to `desired`.
pub fn diff(
    desired: &DesiredStateSnapshot,
    live: &BTreeMap<ResourceKey, LiveResource>,
    options: DiffOptions<'_>,
) -> DiffResult {
    let mut result = DiffResult::default();
    let mut deletes = Vec::new();

    for (key, manifest) in desired.resources() {
        let last = options.last_applied.get(key);
        let unchanged_since_apply = last == Some(manifest);

        let (action, operations, live_missing) = match live.get(key) {
            None => (PatchAction::Create, json_patch::Patch(Vec::new()), true),
            Some(current) => {
                let operations = json_patch::diff(&normalize_live(current.object.as_value()), manifest.as_value());
                if operations.0.is_empty() {
                    continue;
                }
                (PatchAction::Update, operations, false)
            }
        };

        let cause = match (last, unchanged_since_apply) {
            (None, _) if action == PatchAction::Create => PatchCause::FirstProvision,
            (Some(_), true) => PatchCause::Drift,
            _ => PatchCause::SourceChange,
        };

        if cause == PatchCause::Drift {
            result.drift.push(DriftItem {
                key: key.clone(),
                live_missing,
                operations: operations.clone(),
            });
            if !options.self_heal {
                continue;
            }
        }

        result.patches.push(Patch {
            action,
            key: key.clone(),
            manifest: manifest.clone(),
            operations,
            cause,
            rank: PatchRank::of(manifest),
        });
    }

    for (key, current) in live {
        if desired.get(key).is_some() || current.object.instance() != Some(options.application) {
            continue;
        }
        if options.prune {
            deletes.push(Patch {
                action: PatchAction::Delete,
                key: key.clone(),
                manifest: current.object.clone(),
                operations: json_patch::Patch(Vec::new()),
                cause: PatchCause::Orphaned,
                rank: PatchRank::of(&current.object),
            });
        } else {
            result.orphans.push(key.clone());
        }
    }

    result.patches.sort_by(|a, b| a.rank.cmp(&b.rank));
    deletes.sort_by_key(|p| Reverse(p.rank.clone()));
    result.patches.extend(deletes);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::manifest::INSTANCE_LABEL;
    use crate::gitops::snapshot::RevisionId;
    use serde_json::json;

    fn manifest(kind: &str, ns: &str, name: &str, data: Value) -> Manifest {
        let mut m = Manifest::new(json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": { "name": name },
            "data": data,
        }));
        if !ns.is_empty() {
            m.set_namespace(ns);
        }
        m.set_label(INSTANCE_LABEL, "shop");
        m
    }

    fn snapshot(manifests: &[Manifest]) -> DesiredStateSnapshot {
        let resources = manifests.iter().map(|m| (m.key(), m.clone())).collect();
        DesiredStateSnapshot::new(RevisionId::new("r1"), resources)
    }

    fn live_of(manifest: &Manifest, version: &str) -> LiveResource {
        let mut object = manifest.as_value().clone();
        object["metadata"]["resourceVersion"] = json!(version);
        object["metadata"]["uid"] = json!("uid-1");
        object["status"] = json!({"ready": true});
        LiveResource {
            key: manifest.key(),
            object: Manifest::new(object),
            resource_version: version.to_string(),
        }
    }

    fn live_map(items: Vec<LiveResource>) -> BTreeMap<ResourceKey, LiveResource> {
        items.into_iter().map(|l| (l.key.clone(), l)).collect()
    }

    fn options<'a>(last: &'a BTreeMap<ResourceKey, Manifest>, prune: bool, self_heal: bool) -> DiffOptions<'a> {
        DiffOptions {
            application: "shop",
            prune,
            self_heal,
            last_applied: last,
        }
    }

    #[test]
    fn test_normalize_strips_server_fields() {
        let live = json!({
            "kind": "ConfigMap",
            "metadata": {"name": "a", "uid": "x", "resourceVersion": "3", "generation": 2, "labels": {"k": "v"}},
            "status": {"phase": "Bound"}
        });
        assert_eq!(
            normalize_live(&live),
            json!({"kind": "ConfigMap", "metadata": {"name": "a", "labels": {"k": "v"}}})
        );
    }

    #[test]
    fn test_first_provision_creates() {
        let cm = manifest("ConfigMap", "shop", "cfg", json!({"a": "1"}));
        let last = BTreeMap::new();
        let result = diff(&snapshot(&[cm.clone()]), &BTreeMap::new(), options(&last, false, false));
        assert_eq!(result.patches.len(), 1);
        assert_eq!(result.patches[0].action, PatchAction::Create);
        assert_eq!(result.patches[0].cause, PatchCause::FirstProvision);
        assert!(result.drift.is_empty());
    }

    #[test]
    fn test_identical_live_is_in_sync() {
        let cm = manifest("ConfigMap", "shop", "cfg", json!({"a": "1"}));
        let last: BTreeMap<_, _> = [(cm.key(), cm.clone())].into_iter().collect();
        let live = live_map(vec![live_of(&cm, "4")]);
        let result = diff(&snapshot(&[cm]), &live, options(&last, true, true));
        assert!(result.is_in_sync());
    }

    #[test]
    fn test_source_change_updates() {
        let old = manifest("ConfigMap", "shop", "cfg", json!({"a": "1"}));
        let new = manifest("ConfigMap", "shop", "cfg", json!({"a": "2"}));
        let last: BTreeMap<_, _> = [(old.key(), old.clone())].into_iter().collect();
        let live = live_map(vec![live_of(&old, "4")]);
        let result = diff(&snapshot(&[new]), &live, options(&last, false, false));
        assert_eq!(result.patches.len(), 1);
        let patch = &result.patches[0];
        assert_eq!(patch.action, PatchAction::Update);
        assert_eq!(patch.cause, PatchCause::SourceChange);
        assert!(!patch.operations.0.is_empty());
    }

    #[test]
    fn test_drift_reported_without_self_heal() {
        let cm = manifest("ConfigMap", "shop", "cfg", json!({"a": "1"}));
        let edited = manifest("ConfigMap", "shop", "cfg", json!({"a": "edited"}));
        let last: BTreeMap<_, _> = [(cm.key(), cm.clone())].into_iter().collect();
        let live = live_map(vec![live_of(&edited, "5")]);

        let report = diff(&snapshot(&[cm.clone()]), &live, options(&last, false, false));
        assert!(report.patches.is_empty());
        assert_eq!(report.drift.len(), 1);
        assert!(!report.drift[0].live_missing);

        let heal = diff(&snapshot(&[cm]), &live, options(&last, false, true));
        assert_eq!(heal.patches.len(), 1);
        assert_eq!(heal.patches[0].cause, PatchCause::Drift);
    }

    #[test]
    fn test_deleted_out_of_band_is_drift() {
        let cm = manifest("ConfigMap", "shop", "cfg", json!({"a": "1"}));
        let last: BTreeMap<_, _> = [(cm.key(), cm.clone())].into_iter().collect();
        let result = diff(&snapshot(&[cm]), &BTreeMap::new(), options(&last, false, false));
        assert!(result.patches.is_empty());
        assert!(result.drift[0].live_missing);
    }

    #[test]
    fn test_orphans_pruned_only_when_enabled() {
        let kept = manifest("ConfigMap", "shop", "kept", json!({}));
        let gone = manifest("ConfigMap", "shop", "gone", json!({}));
        let mut foreign = manifest("ConfigMap", "shop", "foreign", json!({}));
        foreign.set_label(INSTANCE_LABEL, "other-app");
        let last: BTreeMap<_, _> = [(kept.key(), kept.clone())].into_iter().collect();
        let live = live_map(vec![live_of(&kept, "1"), live_of(&gone, "2"), live_of(&foreign, "3")]);

        let report = diff(&snapshot(&[kept.clone()]), &live, options(&last, false, false));
        assert_eq!(report.orphans, vec![gone.key()]);
        assert!(report.patches.is_empty());

        let prune = diff(&snapshot(&[kept]), &live, options(&last, true, false));
        assert!(prune.orphans.is_empty());
        assert_eq!(prune.patches.len(), 1);
        assert_eq!(prune.patches[0].action, PatchAction::Delete);
        assert_eq!(prune.patches[0].cause, PatchCause::Orphaned);
        assert_eq!(prune.patches[0].key, gone.key());
    }

    #[test]
    fn test_patch_ordering() {
        let mut early = manifest("ConfigMap", "shop", "zz-early", json!({}));
        early.as_value_mut()["metadata"]["annotations"] = json!({ "tideline.io/sync-wave": "-1" });
        let deploy = manifest("Deployment", "shop", "api", json!({}));
        let svc = manifest("Service", "shop", "api", json!({}));
        let ns = manifest("Namespace", "", "shop", json!({}));
        let crd = manifest("CustomResourceDefinition", "", "widgets.example.io", json!({}));
        let old_svc = manifest("Service", "shop", "legacy", json!({}));
        let old_deploy = manifest("Deployment", "shop", "legacy", json!({}));

        let last = BTreeMap::new();
        let live = live_map(vec![live_of(&old_svc, "1"), live_of(&old_deploy, "2")]);
        let result = diff(
            &snapshot(&[deploy, svc, ns, crd, early]),
            &live,
            options(&last, true, false),
        );
        let order: Vec<String> = result
            .patches
            .iter()
            .map(|p| format!("{} {}", p.action, p.key))
            .collect();
        assert_eq!(
            order,
            vec![
                "create ConfigMap/shop/zz-early",
                "create CustomResourceDefinition/widgets.example.io",
                "create Namespace/shop",
                "create Service/shop/api",
                "create Deployment/shop/api",
                "delete Deployment/shop/legacy",
                "delete Service/shop/legacy",
            ]
        );
    }

    #[test]
    fn test_diff_is_deterministic() {
        let a = manifest("ConfigMap", "shop", "a", json!({"x": 1}));
        let b = manifest("Secret", "shop", "b", json!({"y": 2}));
        let last = BTreeMap::new();
        let first = diff(&snapshot(&[a.clone(), b.clone()]), &BTreeMap::new(), options(&last, false, false));
        let second = diff(&snapshot(&[b, a]), &BTreeMap::new(), options(&last, false, false));
        assert_eq!(first, second);
    }
}
