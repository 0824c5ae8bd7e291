//! Object store abstraction over the Kubernetes API
//!
//! Reconcilers only talk to the API server through [`ObjectStore`], which
//! keeps the resourceVersion compare-and-swap visible: `update` and
//! `update_status` fail with a Conflict when the object changed since it was
//! read. [`KubeStore`] is the production implementation; [`MemoryStore`]
//! implements the same semantics in-process for tests.

mod cache;
mod index;
mod kube_store;
mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::Resource;

pub use self::index::{
    claim_namespaced_name, claim_indexes, FieldIndex, FieldIndexes, CLAIM_NAMESPACED_NAME_INDEX,
};
pub use self::cache::IndexCache;
pub use self::kube_store::KubeStore;
pub use self::memory::{MemoryStore, StoreOperation};

use crate::Result;

/// Namespace and name of a namespaced object
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Selection for [`ObjectStore::list`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Restrict to one namespace; `None` lists across all namespaces
    pub namespace: Option<String>,
    /// Restrict to objects whose registered field index has this value
    pub field: Option<(String, String)>,
}

impl ListQuery {
    /// Every object in every namespace
    pub fn all() -> Self {
        Self::default()
    }

    /// Every object in one namespace
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            field: None,
        }
    }

    /// Restrict to objects whose field index `index` equals `value`
    pub fn matching_field(mut self, index: impl Into<String>, value: impl Into<String>) -> Self {
        self.field = Some((index.into(), value.into()));
        self
    }
}

/// Generic access to one kind of namespaced object
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Read one object
    async fn get(&self, key: &ObjectKey) -> Result<K>;

    /// List objects matching the query
    async fn list(&self, query: &ListQuery) -> Result<Vec<K>>;

    /// Create an object; fails with AlreadyExists if it is present
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an object's metadata and spec; fails with Conflict on a stale resourceVersion
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace an object's status; fails with Conflict on a stale resourceVersion
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Delete an object; objects with finalizers are only marked for deletion
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Shared handle to a store
pub type SharedStore<K> = Arc<dyn ObjectStore<K>>;
