//! In-memory [`ObjectStore`] for reconciler tests
//!
//! Mimics the API server behaviours the reconcilers depend on:
//! resourceVersion checks, generateName, generation bumps on spec change,
//! status carried separately from the main resource, and finalizer-gated
//! deletion. Every mutation is appended to a [`Journal`] that can be shared
//! across stores to assert on cross-kind ordering. Stores that stand for one
//! cluster also share a [`Sequence`], so uids and resourceVersions are unique
//! across kinds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ObjectKey, ObjectStore, Selector};
use crate::error::{OperatorError, Result};

/// Ordered log of writes, e.g. `delete ClusterRole/controlplane-cp-00001`
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Source of uids, generated-name suffixes and resourceVersions
pub type Sequence = Arc<AtomicU64>;

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    writes: usize,
    conflicts: u32,
}

pub struct MemoryStore<K> {
    state: Mutex<State<K>>,
    journal: Journal,
    sequence: Sequence,
}

fn kind<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_string()
}

fn timestamp(seconds: u64) -> Time {
    Time(DateTime::<Utc>::default() + chrono::Duration::seconds(seconds as i64))
}

/// Everything but metadata and status
fn body(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    value
}

fn set_status(target: &mut Value, status: Option<&Value>) {
    if let Some(map) = target.as_object_mut() {
        match status {
            Some(status) => {
                map.insert("status".to_string(), status.clone());
            }
            None => {
                map.remove("status");
            }
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_journal(Journal::default())
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self::shared(journal, Sequence::default())
    }

    /// A store that is one kind of a larger in-memory cluster
    pub fn shared(journal: Journal, sequence: Sequence) -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                writes: 0,
                conflicts: 0,
            }),
            journal,
            sequence,
        }
    }

    fn tick(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap()
    }

    fn record(&self, verb: &str, key: &ObjectKey) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{} {}/{}", verb, kind::<K>(), key.name));
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Fail the next `count` replace or status writes with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().conflicts = count;
    }

    pub fn snapshot(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    pub fn objects(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    /// Store an object as a user would create it
    pub fn insert(&self, obj: K) -> K {
        self.create_sync(&obj).unwrap()
    }

    /// Mutate a stored object the way another actor would (user edit,
    /// workload controller status update). Bumps generation on body changes.
    pub fn update(&self, key: &ObjectKey, mutate: impl FnOnce(&mut K)) -> K {
        let mut state = self.lock();
        let counter = self.tick();
        let stored = state.objects.get_mut(key).unwrap();
        let before = body(&serde_json::to_value(&*stored).unwrap());
        mutate(stored);
        let after = body(&serde_json::to_value(&*stored).unwrap());
        let meta = stored.meta_mut();
        if before != after {
            meta.generation = Some(meta.generation.unwrap_or(0) + 1);
        }
        meta.resource_version = Some(counter.to_string());
        stored.clone()
    }

    fn create_sync(&self, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        let mut state = self.lock();
        let counter = self.tick();

        let meta = obj.meta_mut();
        if meta.name.is_none() {
            let prefix = meta.generate_name.clone().ok_or_else(|| {
                OperatorError::InvalidConfig("name or generateName is required".to_string())
            })?;
            meta.name = Some(format!("{}{:05x}", prefix, counter));
        }
        meta.uid = Some(format!("{:08x}-uid", counter));
        meta.resource_version = Some(counter.to_string());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(timestamp(counter));
        meta.deletion_timestamp = None;

        let key = ObjectKey::of(&obj).ok_or_else(|| {
            OperatorError::InvalidConfig("object has no name".to_string())
        })?;
        if state.objects.contains_key(&key) {
            return Err(OperatorError::already_exists(kind::<K>(), &key.name));
        }
        state.objects.insert(key.clone(), obj.clone());
        state.writes += 1;
        drop(state);
        self.record("create", &key);
        Ok(obj)
    }

    /// Fetch the stored copy for a write, enforcing optimistic concurrency
    fn stored_for_write(state: &mut State<K>, obj: &K) -> Result<(ObjectKey, K)> {
        let key = ObjectKey::of(obj).ok_or_else(|| {
            OperatorError::InvalidConfig("object has no name".to_string())
        })?;
        if state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(OperatorError::conflict(kind::<K>(), &key.name));
        }
        let stored = state.objects.get(&key).cloned().ok_or_else(|| {
            OperatorError::not_found(kind::<K>(), &key.name, key.namespace.as_deref())
        })?;
        if obj.meta().resource_version != stored.meta().resource_version {
            return Err(OperatorError::conflict(kind::<K>(), &key.name));
        }
        Ok((key, stored))
    }
}

impl<K> Default for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        Ok(self.snapshot(key))
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<K>> {
        Ok(self
            .lock()
            .objects
            .values()
            .filter(|o| selector.matches(o.meta().namespace.as_deref(), o.meta().labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        self.create_sync(obj)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let mut state = self.lock();
        let (key, stored) = Self::stored_for_write(&mut *state, obj)?;

        let stored_value = serde_json::to_value(&stored)?;
        let mut next_value = serde_json::to_value(obj)?;
        set_status(&mut next_value, stored_value.get("status"));
        let spec_changed = body(&stored_value) != body(&next_value);
        let mut next: K = serde_json::from_value(next_value)?;

        let counter = self.tick();
        let stored_meta = stored.meta();
        let meta = next.meta_mut();
        meta.uid = stored_meta.uid.clone();
        meta.creation_timestamp = stored_meta.creation_timestamp.clone();
        meta.deletion_timestamp = stored_meta.deletion_timestamp.clone();
        meta.generation = stored_meta
            .generation
            .map(|g| if spec_changed { g + 1 } else { g });
        meta.resource_version = Some(counter.to_string());
        state.writes += 1;

        let finalized = meta.deletion_timestamp.is_some()
            && meta.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if finalized {
            state.objects.remove(&key);
            drop(state);
            self.record("remove", &key);
        } else {
            state.objects.insert(key.clone(), next.clone());
            drop(state);
            self.record("replace", &key);
        }
        Ok(next)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let mut state = self.lock();
        let (key, stored) = Self::stored_for_write(&mut *state, obj)?;

        let mut stored_value = serde_json::to_value(&stored)?;
        let incoming = serde_json::to_value(obj)?;
        set_status(&mut stored_value, incoming.get("status"));
        let mut next: K = serde_json::from_value(stored_value)?;

        next.meta_mut().resource_version = Some(self.tick().to_string());
        state.writes += 1;
        state.objects.insert(key.clone(), next.clone());
        drop(state);
        self.record("status", &key);
        Ok(next)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.lock();
        let counter = self.tick();
        let Some(stored) = state.objects.get_mut(key) else {
            return Ok(());
        };

        let meta = stored.meta_mut();
        if meta.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(timestamp(counter));
                meta.resource_version = Some(counter.to_string());
                state.writes += 1;
                drop(state);
                self.record("mark-deleted", key);
            }
            return Ok(());
        }

        state.objects.remove(key);
        state.writes += 1;
        drop(state);
        self.record("delete", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map(name: Option<&str>, data: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: name.map(str::to_string),
                generate_name: Some("cm-".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some([("k".to_string(), data.to_string())].into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_generate_name_and_stale_writes() {
        let store = MemoryStore::<ConfigMap>::new();
        let created = store.create(&config_map(None, "a")).await.unwrap();
        assert!(created.metadata.name.as_deref().unwrap().starts_with("cm-"));

        let mut first = created.clone();
        first.data = Some([("k".to_string(), "b".to_string())].into());
        let updated = store.replace(&first).await.unwrap();
        assert_eq!(updated.metadata.generation, Some(2));

        // same resourceVersion as the first write
        let err = store.replace(&first).await.unwrap_err();
        assert!(matches!(err, OperatorError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_finalizer_gates_removal() {
        let journal = Journal::default();
        let store = MemoryStore::<ConfigMap>::with_journal(journal.clone());
        let mut cm = config_map(Some("gated"), "a");
        cm.metadata.finalizers = Some(vec!["example.com/cleanup".to_string()]);
        let cm = store.insert(cm);
        let key = ObjectKey::of(&cm).unwrap();

        store.delete(&key).await.unwrap();
        let mut marked = store.snapshot(&key).unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        marked.metadata.finalizers = None;
        store.replace(&marked).await.unwrap();
        assert!(store.snapshot(&key).is_none());
        assert_eq!(
            journal.lock().unwrap().last().map(String::as_str),
            Some("remove ConfigMap/gated")
        );
    }

    #[tokio::test]
    async fn test_shared_sequence_keeps_uids_distinct() {
        let journal = Journal::default();
        let sequence = Sequence::default();
        let first = MemoryStore::<ConfigMap>::shared(journal.clone(), sequence.clone());
        let second = MemoryStore::<ConfigMap>::shared(journal, sequence);

        let a = first.insert(config_map(Some("a"), "x"));
        let b = second.insert(config_map(Some("b"), "x"));
        assert_ne!(a.metadata.uid, b.metadata.uid);
        assert_ne!(a.metadata.resource_version, b.metadata.resource_version);

        let isolated = MemoryStore::<ConfigMap>::new();
        let c = isolated.insert(config_map(Some("c"), "x"));
        assert_eq!(c.metadata.uid, a.metadata.uid);
    }
}
