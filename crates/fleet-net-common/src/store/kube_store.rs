//! [`ObjectStore`] backed by the Kubernetes API

use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{IndexCache, ListQuery, ObjectKey, ObjectStore};
use crate::{Error, Result};

/// Object store over `kube::Api<K>`
///
/// `update` and `update_status` use PUT (`replace`), so the resourceVersion
/// in the submitted object is checked by the API server. Field-index queries
/// are answered from an [`IndexCache`]; a store without one rejects them.
pub struct KubeStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    client: Client,
    cache: Option<Arc<IndexCache<K>>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    /// Store without field indexes
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: None,
            _kind: PhantomData,
        }
    }

    /// Store answering field-index queries from `cache`
    pub fn with_index_cache(client: Client, cache: Arc<IndexCache<K>>) -> Self {
        Self {
            client,
            cache: Some(cache),
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn target(obj: &K) -> Result<ObjectKey> {
        let key = ObjectKey::of(obj);
        if key.name.is_empty() || key.namespace.is_empty() {
            return Err(Error::validation(format!(
                "{} is missing a namespace or name",
                K::kind(&K::DynamicType::default())
            )));
        }
        Ok(key)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    async fn get(&self, key: &ObjectKey) -> Result<K> {
        Ok(self.api(&key.namespace).get(&key.name).await?)
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<K>> {
        if let Some((index, value)) = &query.field {
            let cache = self.cache.as_ref().ok_or_else(|| {
                Error::validation(format!("field index {index:?} is not registered"))
            })?;
            let mut items = cache.matching(index, value).await?;
            if let Some(ns) = &query.namespace {
                items.retain(|obj| obj.meta().namespace.as_deref() == Some(ns.as_str()));
            }
            return Ok(items);
        }

        let api: Api<K> = match &query.namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = Self::target(obj)?;
        Ok(self
            .api(&key.namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = Self::target(obj)?;
        Ok(self
            .api(&key.namespace)
            .replace(&key.name, &PostParams::default(), obj)
            .await?)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let key = Self::target(obj)?;
        let body = serde_json::to_vec(obj)?;
        Ok(self
            .api(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), body)
            .await?)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
