//! Cluster object manifests and their identity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Label that ties a cluster object to the Application that owns it.
pub const INSTANCE_LABEL: &str = "app.tideline.io/instance";

/// Annotation that moves a resource into an earlier or later apply wave.
pub const SYNC_WAVE_ANNOTATION: &str = "tideline.io/sync-wave";

/// Kinds that live outside any namespace.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "StorageClass",
    "PersistentVolume",
    "PriorityClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

/// Returns true if objects of `kind` are cluster-scoped.
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Dependency weight of a kind. Lower weights are applied first.
pub fn kind_weight(kind: &str) -> u8 {
    match kind {
        "CustomResourceDefinition" => 0,
        "Namespace" => 1,
        "ServiceAccount" | "ClusterRole" | "Role" | "ClusterRoleBinding" | "RoleBinding"
        | "PriorityClass" => 2,
        "ConfigMap" | "Secret" | "ExternalSecret" | "SecretStore" => 3,
        "StorageClass" | "PersistentVolume" | "PersistentVolumeClaim" => 4,
        "Service" => 5,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" | "CronJob" | "Pod" => {
            6
        }
        "Ingress" | "HorizontalPodAutoscaler" | "PodDisruptionBudget" | "NetworkPolicy" => 7,
        _ => 8,
    }
}

/// Identity of a cluster object: (kind, namespace, name).
///
/// Cluster-scoped objects have an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object.
    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, "", name)
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// A concrete cluster object as a JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Value);

impl Manifest {
    /// Wraps an object. Callers are expected to have validated the shape;
    /// accessors fall back to empty strings on missing fields.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or("")
    }

    pub fn api_version(&self) -> &str {
        self.0.get("apiVersion").and_then(Value::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.metadata_str("name").unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata_str("namespace").unwrap_or("")
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind(), self.namespace(), self.name())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.0
            .pointer("/metadata/labels")
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0
            .pointer("/metadata/annotations")
            .and_then(|annotations| annotations.get(key))
            .and_then(Value::as_str)
    }

    /// Sync wave from the annotation, `0` when absent or unparsable.
    pub fn sync_wave(&self) -> i32 {
        self.annotation(SYNC_WAVE_ANNOTATION)
            .and_then(|w| w.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Name of the Application that owns this object, if tracked.
    pub fn instance(&self) -> Option<&str> {
        self.label(INSTANCE_LABEL)
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()["namespace"] = Value::String(namespace.to_string());
    }

    pub fn clear_namespace(&mut self) {
        if let Some(meta) = self.0.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("namespace");
        }
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        let labels = &mut self.metadata_mut()["labels"];
        if !labels.is_object() {
            *labels = Value::Object(Map::new());
        }
        labels[key] = Value::String(value.to_string());
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn as_value_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(Value::as_str)
    }

    /// The `metadata` object, created if missing. `Value`'s `IndexMut`
    /// inserts keys into objects, so both levels are forced to objects first.
    fn metadata_mut(&mut self) -> &mut Value {
        if !self.0.is_object() {
            self.0 = Value::Object(Map::new());
        }
        let metadata = &mut self.0["metadata"];
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        metadata
    }
}

impl From<Value> for Manifest {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
