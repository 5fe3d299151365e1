//! Immutable, content-addressed desired state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::manifest::{Manifest, ResourceKey};

/// Opaque identifier of a source revision (commit SHA, content hash, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The rendered manifests of one revision.
///
/// Keys are ordered, so iteration and serialisation are deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredStateSnapshot {
    revision: RevisionId,
    digest: String,
    resources: BTreeMap<ResourceKey, Manifest>,
}

impl DesiredStateSnapshot {
    pub fn new(revision: RevisionId, resources: BTreeMap<ResourceKey, Manifest>) -> Self {
        let digest = content_digest(&resources);
        Self {
            revision,
            digest,
            resources,
        }
    }

    pub fn revision(&self) -> &RevisionId {
        &self.revision
    }

    /// Hex SHA-256 over the canonical serialisation of all manifests.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn resources(&self) -> &BTreeMap<ResourceKey, Manifest> {
        &self.resources
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Manifest> {
        self.resources.get(key)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Canonical multi-document YAML of the manifest set.
    pub fn to_yaml(&self) -> String {
        let mut out = String::new();
        for manifest in self.resources.values() {
            out.push_str("---\n");
            // serde_json::Value -> YAML cannot fail: keys are strings.
            out.push_str(&serde_yaml::to_string(manifest.as_value()).unwrap_or_default());
        }
        out
    }
}

fn content_digest(resources: &BTreeMap<ResourceKey, Manifest>) -> String {
    let mut hasher = Sha256::new();
    for (key, manifest) in resources {
        hasher.update(key.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(manifest.as_value()).as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// JSON with object keys sorted at every level, independent of how the
/// map type orders its entries.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
