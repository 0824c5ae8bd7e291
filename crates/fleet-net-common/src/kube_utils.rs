//! Kubernetes client construction and object metadata helpers

use std::path::Path;
use std::time::Duration;

use kube::api::ObjectMeta;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
///
/// The member agent holds two clients: one inferred for its own cluster and
/// one built from the hub kubeconfig.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// The object has a deletion timestamp
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// The object carries `finalizer`
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Add `finalizer`; returns false when it was already present
pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Remove `finalizer`; returns false when it was not present
pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if !has_finalizer(obj, finalizer) {
        return false;
    }
    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }
    true
}

/// Value of an annotation
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Set an annotation; returns false when it already had this value
pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: impl Into<String>) -> bool {
    let value = value.into();
    let annotations = meta.annotations.get_or_insert_with(Default::default);
    if annotations.get(key) == Some(&value) {
        return false;
    }
    annotations.insert(key.to_string(), value);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ServiceImport, ServiceImportSpec};

    #[test]
    fn finalizers_are_added_and_removed_once() {
        let mut si = ServiceImport::new("app", ServiceImportSpec {});
        assert!(!has_finalizer(&si, "a/b"));
        assert!(add_finalizer(&mut si, "a/b"));
        assert!(!add_finalizer(&mut si, "a/b"));
        assert_eq!(si.metadata.finalizers.as_ref().map(Vec::len), Some(1));
        assert!(remove_finalizer(&mut si, "a/b"));
        assert!(!remove_finalizer(&mut si, "a/b"));
        assert!(!has_finalizer(&si, "a/b"));
    }

    #[test]
    fn annotations_report_changes() {
        let mut meta = ObjectMeta::default();
        assert_eq!(annotation(&meta, "k"), None);
        assert!(set_annotation(&mut meta, "k", "1"));
        assert!(!set_annotation(&mut meta, "k", "1"));
        assert!(set_annotation(&mut meta, "k", "2"));
        assert_eq!(annotation(&meta, "k"), Some("2"));
    }

    #[test]
    fn deletion_timestamp_marks_deleting() {
        let mut si = ServiceImport::new("app", ServiceImportSpec {});
        assert!(!is_deleting(&si));
        si.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert!(is_deleting(&si));
    }
}
