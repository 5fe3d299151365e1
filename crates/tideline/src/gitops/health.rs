//! Health assessment of live resources.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cluster::LiveResource;
use super::manifest::ResourceKey;
use super::snapshot::DesiredStateSnapshot;

/// Health of one resource or of a whole Application.
///
/// Variants are declared from best to worst; aggregation takes the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Missing,
    Degraded,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Progressing => write!(f, "Progressing"),
            HealthStatus::Missing => write!(f, "Missing"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Health of a single live object.
pub fn assess(live: &LiveResource) -> HealthStatus {
    let object = live.object.as_value();
    match live.key.kind.as_str() {
        "Deployment" | "StatefulSet" | "ReplicaSet" => replica_health(object),
        "DaemonSet" => daemon_set_health(object),
        "Job" => job_health(object),
        "Pod" => match status_str(object, "phase") {
            Some("Running") | Some("Succeeded") => HealthStatus::Healthy,
            Some("Failed") => HealthStatus::Degraded,
            _ => HealthStatus::Progressing,
        },
        "PersistentVolumeClaim" => match status_str(object, "phase") {
            Some("Bound") => HealthStatus::Healthy,
            Some("Lost") => HealthStatus::Degraded,
            _ => HealthStatus::Progressing,
        },
        _ => HealthStatus::Healthy,
    }
}

/// Worst health across the desired resources. Declared but absent objects
/// are `Missing`; live objects not in `desired` are ignored.
pub fn aggregate(
    desired: &DesiredStateSnapshot,
    live: &BTreeMap<ResourceKey, LiveResource>,
) -> HealthStatus {
    desired
        .resources()
        .keys()
        .map(|key| live.get(key).map(assess).unwrap_or(HealthStatus::Missing))
        .max()
        .unwrap_or(HealthStatus::Healthy)
}

fn status_str<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    object.get("status")?.get(field)?.as_str()
}

fn status_i64(object: &Value, field: &str) -> Option<i64> {
    object.get("status")?.get(field)?.as_i64()
}

fn has_condition(object: &Value, kind: &str, reason: Option<&str>) -> bool {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(kind)
                    && reason.map_or(true, |r| c.get("reason").and_then(Value::as_str) == Some(r))
            })
        })
        .unwrap_or(false)
}

fn replica_health(object: &Value) -> HealthStatus {
    if has_condition(object, "Progressing", Some("ProgressDeadlineExceeded")) {
        return HealthStatus::Degraded;
    }
    let wanted = object
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    match status_i64(object, "readyReplicas") {
        Some(ready) if ready >= wanted => HealthStatus::Healthy,
        None if wanted == 0 => HealthStatus::Healthy,
        _ => HealthStatus::Progressing,
    }
}

fn daemon_set_health(object: &Value) -> HealthStatus {
    match (
        status_i64(object, "desiredNumberScheduled"),
        status_i64(object, "numberReady"),
    ) {
        (Some(wanted), Some(ready)) if ready >= wanted => HealthStatus::Healthy,
        _ => HealthStatus::Progressing,
    }
}

fn job_health(object: &Value) -> HealthStatus {
    if has_condition(object, "Failed", None) {
        HealthStatus::Degraded
    } else if status_i64(object, "succeeded").unwrap_or(0) > 0 {
        HealthStatus::Healthy
    } else {
        HealthStatus::Progressing
    }
}
