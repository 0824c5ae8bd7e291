//! Watch-fed field index for [`super::KubeStore`] list queries
//!
//! A reflector keeps every object of the watched kind in memory and an
//! inverted map from `(index, value)` to object keys is maintained from the
//! same watch events, so an index query costs the number of matches rather
//! than a LIST against the API server.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Event;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Resource};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{FieldIndexes, ObjectKey};
use crate::{Error, Result};

/// Object keys per `(index, value)`
#[derive(Debug, Default)]
struct Postings {
    by_value: HashMap<(String, String), BTreeSet<ObjectKey>>,
    by_object: HashMap<ObjectKey, Vec<(String, String)>>,
}

impl Postings {
    fn insert(&mut self, key: ObjectKey, values: Vec<(String, String)>) {
        self.remove(&key);
        for value in &values {
            self.by_value
                .entry(value.clone())
                .or_default()
                .insert(key.clone());
        }
        self.by_object.insert(key, values);
    }

    fn remove(&mut self, key: &ObjectKey) {
        let Some(values) = self.by_object.remove(key) else {
            return;
        };
        for value in values {
            if let Some(keys) = self.by_value.get_mut(&value) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_value.remove(&value);
                }
            }
        }
    }

    fn keys(&self, index: &str, value: &str) -> Vec<ObjectKey> {
        self.by_value
            .get(&(index.to_string(), value.to_string()))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct State {
    current: Postings,
    /// Built during a relist and swapped in once it completes
    relist: Option<Postings>,
}

/// In-memory index over one watched kind
pub struct IndexCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    objects: Store<K>,
    indexes: FieldIndexes<K>,
    state: RwLock<State>,
}

impl<K> IndexCache<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    /// Cache over `api` together with the future that feeds it
    ///
    /// Queries wait until the first list has completed, so the future must be
    /// polled for them to return.
    pub fn watch(
        api: Api<K>,
        config: watcher::Config,
        indexes: FieldIndexes<K>,
    ) -> (Arc<Self>, impl Future<Output = ()> + Send + 'static) {
        let (objects, writer) = reflector::store();
        let cache = Arc::new(Self::new(objects, indexes));
        let feed = cache.clone();
        let run = reflector(writer, watcher(api, config).default_backoff()).for_each(move |event| {
            match event {
                Ok(event) => feed.apply(&event),
                Err(e) => warn!(error = %e, "Index watch failed, retrying"),
            }
            std::future::ready(())
        });
        (cache, run)
    }
}

impl<K> IndexCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    /// Index the objects of an existing reflector store
    ///
    /// Every event applied to the store's writer must also be passed to
    /// [`IndexCache::apply`].
    pub fn new(objects: Store<K>, indexes: FieldIndexes<K>) -> Self {
        Self {
            objects,
            indexes,
            state: RwLock::new(State::default()),
        }
    }

    /// Update the postings from one watch event
    pub fn apply(&self, event: &Event<K>) {
        let mut state = self.state.write();
        match event {
            Event::Apply(obj) => state
                .current
                .insert(ObjectKey::of(obj), self.indexes.values(obj)),
            Event::Delete(obj) => state.current.remove(&ObjectKey::of(obj)),
            Event::Init => state.relist = Some(Postings::default()),
            Event::InitApply(obj) => state
                .relist
                .get_or_insert_with(Postings::default)
                .insert(ObjectKey::of(obj), self.indexes.values(obj)),
            Event::InitDone => {
                if let Some(relisted) = state.relist.take() {
                    state.current = relisted;
                }
            }
        }
    }

    /// Objects whose index `index` equals `value`, ordered by namespace and name
    pub async fn matching(&self, index: &str, value: &str) -> Result<Vec<K>> {
        if !self.indexes.contains(index) {
            return Err(Error::validation(format!(
                "field index {index:?} is not registered"
            )));
        }
        self.objects
            .wait_until_ready()
            .await
            .map_err(|e| Error::internal_with_context("index cache", e.to_string()))?;

        let keys = self.state.read().current.keys(index, value);
        Ok(keys
            .iter()
            .filter_map(|key| {
                self.objects
                    .get(&ObjectRef::new(&key.name).within(&key.namespace))
            })
            .map(|obj| obj.as_ref().clone())
            .collect())
    }
}
