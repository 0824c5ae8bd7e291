//! In-process [`ObjectStore`] with API server semantics

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{FieldIndexes, ListQuery, ObjectKey, ObjectStore};
use crate::{Error, ErrorKind, Result};

/// Store operations that can have failures injected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOperation {
    /// [`ObjectStore::get`]
    Get,
    /// [`ObjectStore::list`]
    List,
    /// [`ObjectStore::create`]
    Create,
    /// [`ObjectStore::update`]
    Update,
    /// [`ObjectStore::update_status`]
    UpdateStatus,
    /// [`ObjectStore::delete`]
    Delete,
}

/// In-memory object store
///
/// Behaves like the API server for the parts reconcilers depend on:
///
/// * `update` and `update_status` reject a stale resourceVersion with Conflict
/// * `update` ignores status and `update_status` ignores everything but status
/// * generation starts at 1 and is bumped only when the spec changes
/// * `delete` of an object with finalizers sets `deletionTimestamp`; the
///   object disappears once an update clears its finalizers
/// * `list` returns objects ordered by namespace, then name
pub struct MemoryStore<K> {
    objects: RwLock<BTreeMap<ObjectKey, K>>,
    indexes: FieldIndexes<K>,
    resource_version: AtomicU64,
    writes: AtomicUsize,
    failures: Mutex<VecDeque<(StoreOperation, ErrorKind)>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::with_indexes(FieldIndexes::new())
    }
}

impl<K> MemoryStore<K> {
    /// Empty store without field indexes
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store with the given field indexes registered
    pub fn with_indexes(indexes: FieldIndexes<K>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            indexes,
            resource_version: AtomicU64::new(1),
            writes: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next call of `op` fail with `kind`; queued failures fire in order
    pub fn fail_next(&self, op: StoreOperation, kind: ErrorKind) {
        self.failures.lock().push_back((op, kind));
    }

    /// Number of successful create, update, status update and delete calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of objects currently stored
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn next_resource_version(&self) -> String {
        self.resource_version
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    fn injected(&self, op: StoreOperation, key: &str) -> Result<()> {
        let mut failures = self.failures.lock();
        let queued = failures
            .iter()
            .position(|(o, _)| *o == op)
            .and_then(|pos| failures.remove(pos));
        match queued {
            Some((_, kind)) => Err(Error::store(kind, key, format!("injected {op:?} failure"))),
            None => Ok(()),
        }
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    /// Insert an object as-is, bypassing create semantics
    ///
    /// Used by tests to set up objects that are already deleting or carry a
    /// status. Missing resourceVersion and generation are filled in.
    pub fn seed(&self, mut obj: K) -> K {
        let key = ObjectKey::of(&obj);
        let rv = self.next_resource_version();
        let meta = obj.meta_mut();
        meta.resource_version = Some(rv);
        meta.generation.get_or_insert(1);
        meta.uid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        self.objects.write().insert(key, obj.clone());
        obj
    }

    /// Current copy of an object, if present
    pub fn peek(&self, key: &ObjectKey) -> Option<K> {
        self.objects.read().get(key).cloned()
    }
}

fn resource_name(key: &ObjectKey) -> String {
    key.to_string()
}

fn spec_of<K: Serialize>(obj: &K) -> Result<Value> {
    Ok(serde_json::to_value(obj)?
        .get("spec")
        .cloned()
        .unwrap_or(Value::Null))
}

fn without_status<K: Serialize + DeserializeOwned>(obj: &K) -> Result<K> {
    let mut value = serde_json::to_value(obj)?;
    if let Value::Object(map) = &mut value {
        map.remove("status");
    }
    Ok(serde_json::from_value(value)?)
}

/// `target` with its status replaced by the status of `source`
fn with_status_of<K: Serialize + DeserializeOwned>(target: &K, source: &K) -> Result<K> {
    let mut value = serde_json::to_value(target)?;
    let status = serde_json::to_value(source)?
        .get("status")
        .cloned()
        .unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert("status".to_string(), status);
    }
    Ok(serde_json::from_value(value)?)
}

fn check_resource_version<K: Resource>(current: &K, submitted: &K, key: &ObjectKey) -> Result<()> {
    match &submitted.meta().resource_version {
        Some(rv) if Some(rv) != current.meta().resource_version.as_ref() => Err(Error::conflict(
            resource_name(key),
            "the object has been modified; please apply your changes to the latest version and try again",
        )),
        _ => Ok(()),
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<K> {
        self.injected(StoreOperation::Get, &resource_name(key))?;
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(resource_name(key)))
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<K>> {
        self.injected(StoreOperation::List, "list")?;
        let items: Vec<K> = self
            .objects
            .read()
            .iter()
            .filter(|(k, _)| query.namespace.as_ref().map_or(true, |ns| &k.namespace == ns))
            .map(|(_, v)| v.clone())
            .collect();
        match &query.field {
            Some((index, value)) => self.indexes.filter(items, index, value),
            None => Ok(items),
        }
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.injected(StoreOperation::Create, &resource_name(&key))?;
        if key.name.is_empty() {
            return Err(Error::validation_for(resource_name(&key), "name is required"));
        }

        // Status is a subresource and cannot be set on create.
        let mut created = without_status(obj)?;

        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(Error::store(
                ErrorKind::AlreadyExists,
                resource_name(&key),
                "already exists",
            ));
        }
        let rv = self.next_resource_version();
        let meta = created.meta_mut();
        meta.resource_version = Some(rv);
        meta.generation = Some(1);
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
        objects.insert(key, created.clone());
        drop(objects);
        self.wrote();
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.injected(StoreOperation::Update, &resource_name(&key))?;
        let mut objects = self.objects.write();
        let current = objects
            .get(&key)
            .ok_or_else(|| Error::not_found(resource_name(&key)))?;
        check_resource_version(current, obj, &key)?;

        let mut updated = with_status_of(obj, current)?;
        let generation = current.meta().generation.unwrap_or(1);
        let spec_changed = spec_of(obj)? != spec_of(current)?;
        let deletion_timestamp = current.meta().deletion_timestamp.clone();
        let uid = current.meta().uid.clone();
        let created_at = current.meta().creation_timestamp.clone();

        let rv = self.next_resource_version();
        let meta = updated.meta_mut();
        meta.resource_version = Some(rv);
        meta.generation = Some(if spec_changed { generation + 1 } else { generation });
        meta.deletion_timestamp = deletion_timestamp;
        meta.uid = uid;
        meta.creation_timestamp = created_at;

        let finalized = updated.meta().deletion_timestamp.is_some()
            && updated.meta().finalizers.as_ref().map_or(true, |f| f.is_empty());
        if finalized {
            objects.remove(&key);
        } else {
            objects.insert(key, updated.clone());
        }
        drop(objects);
        self.wrote();
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.injected(StoreOperation::UpdateStatus, &resource_name(&key))?;
        let mut objects = self.objects.write();
        let current = objects
            .get(&key)
            .ok_or_else(|| Error::not_found(resource_name(&key)))?;
        check_resource_version(current, obj, &key)?;

        let mut updated = with_status_of(current, obj)?;
        updated.meta_mut().resource_version = Some(self.next_resource_version());
        objects.insert(key, updated.clone());
        drop(objects);
        self.wrote();
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.injected(StoreOperation::Delete, &resource_name(key))?;
        let mut objects = self.objects.write();
        let current = objects
            .get_mut(key)
            .ok_or_else(|| Error::not_found(resource_name(key)))?;

        let has_finalizers = current
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if current.meta().deletion_timestamp.is_none() {
                let rv = self.next_resource_version();
                let meta = current.meta_mut();
                meta.deletion_timestamp = Some(Time(Utc::now()));
                meta.resource_version = Some(rv);
            }
        } else {
            objects.remove(key);
        }
        drop(objects);
        self.wrote();
        Ok(())
    }
}
