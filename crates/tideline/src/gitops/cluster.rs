//! Cluster API boundary and an in-process implementation.
//!
//! The engine only ever writes through [`ClusterApi`], and only from the
//! sync executor. `MemoryCluster` mimics the API server's optimistic
//! concurrency (`resourceVersion`) and lets callers inject faults and
//! out-of-band edits.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::manifest::{Manifest, ResourceKey};

/// Errors returned by a cluster API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(ResourceKey),

    #[error("{0} already exists")]
    AlreadyExists(ResourceKey),

    #[error("Conflict on {key}: expected resourceVersion {expected}, found {actual}")]
    Conflict {
        key: ResourceKey,
        expected: String,
        actual: String,
    },

    #[error("Invalid object: {0}")]
    Invalid(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    #[error("Cluster call timed out after {0}ms")]
    Timeout(u64),
}

impl ClusterError {
    /// Transient errors are worth retrying; the rest fail the resource.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Conflict { .. } | ClusterError::Unavailable(_) | ClusterError::Timeout(_)
        )
    }
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// An object as observed in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveResource {
    pub key: ResourceKey,
    pub object: Manifest,
    pub resource_version: String,
}

/// Equality selector on a single label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, manifest: &Manifest) -> bool {
        manifest.label(&self.key) == Some(self.value.as_str())
    }
}

/// Create/read/update/delete for arbitrary kinds.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> ClusterResult<Option<LiveResource>>;

    async fn list(&self, selector: &LabelSelector) -> ClusterResult<Vec<LiveResource>>;

    async fn create(&self, manifest: &Manifest) -> ClusterResult<LiveResource>;

    /// Replaces the object if its current version is `resource_version`.
    async fn update(&self, manifest: &Manifest, resource_version: &str)
        -> ClusterResult<LiveResource>;

    /// Deletes the object, optionally guarded by its version.
    async fn delete(&self, key: &ResourceKey, resource_version: Option<&str>)
        -> ClusterResult<()>;
}

// ============================================================================
// In-memory cluster
// ============================================================================

/// Kind of write recorded by [`MemoryCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    Create,
    Update,
    Delete,
}

/// A successful write, in order of arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteRecord {
    pub kind: WriteKind,
    pub key: ResourceKey,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ResourceKey, LiveResource>,
    next_version: u64,
    one_shot_faults: HashMap<ResourceKey, VecDeque<ClusterError>>,
    rejections: HashMap<ResourceKey, ClusterError>,
    writes: Vec<WriteRecord>,
}

impl MemoryState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_fault(&mut self, key: &ResourceKey) -> Option<ClusterError> {
        if let Some(err) = self.rejections.get(key) {
            return Some(err.clone());
        }
        let queue = self.one_shot_faults.get_mut(key)?;
        let err = queue.pop_front();
        if queue.is_empty() {
            self.one_shot_faults.remove(key);
        }
        err
    }
}

/// In-process cluster with API-server-like versioning.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<MemoryState>,
    write_latency: Option<Duration>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every write, to widen windows in concurrency tests.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = Some(latency);
        self
    }

    /// Fails the next write to `key` with `err`. Faults queue up.
    pub fn inject_fault(&self, key: &ResourceKey, err: ClusterError) {
        let mut state = self.lock();
        state
            .one_shot_faults
            .entry(key.clone())
            .or_default()
            .push_back(err);
    }

    /// Fails every write to `key` with `err` until cleared.
    pub fn reject(&self, key: &ResourceKey, err: ClusterError) {
        self.lock().rejections.insert(key.clone(), err);
    }

    pub fn clear_rejection(&self, key: &ResourceKey) {
        self.lock().rejections.remove(key);
    }

    /// Edits a live object outside the engine, bumping its version.
    /// Returns false if the object does not exist.
    pub fn mutate<F>(&self, key: &ResourceKey, edit: F) -> bool
    where
        F: FnOnce(&mut Value),
    {
        let mut state = self.lock();
        let version = state.bump();
        match state.objects.get_mut(key) {
            Some(live) => {
                edit(live.object.as_value_mut());
                live.object.as_value_mut()["metadata"]["resourceVersion"] =
                    Value::String(version.clone());
                live.resource_version = version;
                true
            }
            None => false,
        }
    }

    /// Deletes an object outside the engine.
    pub fn remove_out_of_band(&self, key: &ResourceKey) -> bool {
        self.lock().objects.remove(key).is_some()
    }

    /// Seeds an object as if created by someone else.
    pub fn seed(&self, manifest: Manifest) -> LiveResource {
        let mut state = self.lock();
        let version = state.bump();
        let live = materialize(manifest, &version, None);
        state.objects.insert(live.key.clone(), live.clone());
        live
    }

    pub fn object(&self, key: &ResourceKey) -> Option<LiveResource> {
        self.lock().objects.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful writes, in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-write; the map is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        if let Some(latency) = self.write_latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Adds the server-managed fields an API server would populate.
fn materialize(manifest: Manifest, version: &str, previous: Option<&LiveResource>) -> LiveResource {
    let key = manifest.key();
    let mut object = manifest.into_value();

    let (uid, created) = previous
        .map(|p| {
            let meta = &p.object.as_value()["metadata"];
            (meta["uid"].clone(), meta["creationTimestamp"].clone())
        })
        .unwrap_or_else(|| {
            (
                Value::String(uuid::Uuid::new_v4().to_string()),
                Value::String(Utc::now().to_rfc3339()),
            )
        });

    object["metadata"]["resourceVersion"] = Value::String(version.to_string());
    object["metadata"]["uid"] = uid;
    object["metadata"]["creationTimestamp"] = created;

    if let Some(replicas) = object.pointer("/spec/replicas").and_then(Value::as_i64) {
        object["status"] = json!({ "replicas": replicas, "readyReplicas": replicas });
    }

    LiveResource {
        key,
        object: Manifest::new(object),
        resource_version: version.to_string(),
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get(&self, key: &ResourceKey) -> ClusterResult<Option<LiveResource>> {
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn list(&self, selector: &LabelSelector) -> ClusterResult<Vec<LiveResource>> {
        Ok(self
            .lock()
            .objects
            .values()
            .filter(|live| selector.matches(&live.object))
            .cloned()
            .collect())
    }

    async fn create(&self, manifest: &Manifest) -> ClusterResult<LiveResource> {
        self.delay().await;
        let key = manifest.key();
        let mut state = self.lock();
        if let Some(err) = state.take_fault(&key) {
            return Err(err);
        }
        if state.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(key));
        }
        let version = state.bump();
        let live = materialize(manifest.clone(), &version, None);
        state.objects.insert(key.clone(), live.clone());
        state.writes.push(WriteRecord {
            kind: WriteKind::Create,
            key,
        });
        Ok(live)
    }

    async fn update(
        &self,
        manifest: &Manifest,
        resource_version: &str,
    ) -> ClusterResult<LiveResource> {
        self.delay().await;
        let key = manifest.key();
        let mut state = self.lock();
        if let Some(err) = state.take_fault(&key) {
            return Err(err);
        }
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        if current.resource_version != resource_version {
            return Err(ClusterError::Conflict {
                key,
                expected: resource_version.to_string(),
                actual: current.resource_version,
            });
        }
        let version = state.bump();
        let live = materialize(manifest.clone(), &version, Some(&current));
        state.objects.insert(key.clone(), live.clone());
        state.writes.push(WriteRecord {
            kind: WriteKind::Update,
            key,
        });
        Ok(live)
    }

    async fn delete(&self, key: &ResourceKey, resource_version: Option<&str>) -> ClusterResult<()> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(err) = state.take_fault(key) {
            return Err(err);
        }
        let current = state
            .objects
            .get(key)
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        if let Some(expected) = resource_version {
            if current.resource_version != expected {
                return Err(ClusterError::Conflict {
                    key: key.clone(),
                    expected: expected.to_string(),
                    actual: current.resource_version.clone(),
                });
            }
        }
        state.objects.remove(key);
        state.writes.push(WriteRecord {
            kind: WriteKind::Delete,
            key: key.clone(),
        });
        Ok(())
    }
}
