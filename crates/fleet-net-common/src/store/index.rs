//! Field indexes for list queries

use std::fmt;

use crate::crd::InternalServiceExport;
use crate::{Error, Result};

/// Index of hub claims by the namespaced name of the exported Service
pub const CLAIM_NAMESPACED_NAME_INDEX: &str = "spec.serviceReference.namespacedName";

/// Accessor for [`CLAIM_NAMESPACED_NAME_INDEX`]
pub fn claim_namespaced_name(claim: &InternalServiceExport) -> String {
    claim.spec.service_reference.namespaced_name.clone()
}

/// Indexes registered for hub claims
pub fn claim_indexes() -> FieldIndexes<InternalServiceExport> {
    FieldIndexes::new().with(FieldIndex::new(
        CLAIM_NAMESPACED_NAME_INDEX,
        claim_namespaced_name,
    ))
}

/// A named, typed accessor that list queries can filter on
pub struct FieldIndex<K> {
    name: &'static str,
    extract: fn(&K) -> String,
}

impl<K> FieldIndex<K> {
    /// Create an index
    pub fn new(name: &'static str, extract: fn(&K) -> String) -> Self {
        Self { name, extract }
    }

    /// Index name used in list queries
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Index value of an object
    pub fn value(&self, obj: &K) -> String {
        (self.extract)(obj)
    }
}

impl<K> Clone for FieldIndex<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            extract: self.extract,
        }
    }
}

impl<K> fmt::Debug for FieldIndex<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldIndex").field("name", &self.name).finish()
    }
}

/// The set of indexes registered with a store
#[derive(Debug)]
pub struct FieldIndexes<K> {
    indexes: Vec<FieldIndex<K>>,
}

impl<K> Default for FieldIndexes<K> {
    fn default() -> Self {
        Self {
            indexes: Vec::new(),
        }
    }
}

impl<K> Clone for FieldIndexes<K> {
    fn clone(&self) -> Self {
        Self {
            indexes: self.indexes.clone(),
        }
    }
}

impl<K> FieldIndexes<K> {
    /// No indexes
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index
    pub fn with(mut self, index: FieldIndex<K>) -> Self {
        self.indexes.retain(|i| i.name != index.name);
        self.indexes.push(index);
        self
    }

    /// Whether an index called `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i.name == name)
    }

    /// Every registered index name with its value for `obj`
    pub fn values(&self, obj: &K) -> Vec<(String, String)> {
        self.indexes
            .iter()
            .map(|i| (i.name.to_string(), i.value(obj)))
            .collect()
    }

    /// Keep only objects whose index `name` equals `value`
    ///
    /// Querying an index that was never registered is an error, matching the
    /// behavior of a cache without that index.
    pub fn filter(&self, objects: Vec<K>, name: &str, value: &str) -> Result<Vec<K>> {
        let index = self
            .indexes
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| Error::validation(format!("field index {name:?} is not registered")))?;
        Ok(objects
            .into_iter()
            .filter(|obj| index.value(obj) == value)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ExportedObjectReference, InternalServiceExportSpec};

    fn claim(namespaced_name: &str) -> InternalServiceExport {
        InternalServiceExport::new(
            "c",
            InternalServiceExportSpec {
                service_reference: ExportedObjectReference {
                    namespaced_name: namespaced_name.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn claim_index_filters_by_service() {
        let indexes = claim_indexes();
        let objects = vec![claim("work/app"), claim("work/db"), claim("work/app")];
        let matched = indexes
            .filter(objects, CLAIM_NAMESPACED_NAME_INDEX, "work/app")
            .unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn unregistered_index_is_an_error() {
        let indexes: FieldIndexes<InternalServiceExport> = FieldIndexes::new();
        assert!(indexes.filter(vec![claim("a/b")], "spec.nope", "a/b").is_err());
    }
}
