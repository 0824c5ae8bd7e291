//! MultiClusterService CRD: exposes an imported Service through a member-local load balancer

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// MultiClusterService imports a ServiceImport into a member cluster.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "MultiClusterService",
    namespaced,
    status = "MultiClusterServiceStatus",
    shortname = "mcs",
    printcolumn = r#"{"name":"Service-Import","type":"string","jsonPath":".spec.serviceImport.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterServiceSpec {
    /// ServiceImport to expose
    pub service_import: ServiceImportRef,
}

/// Reference to a ServiceImport in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ServiceImportRef {
    /// ServiceImport name
    pub name: String,
}

/// Status of a MultiClusterService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterServiceStatus {
    /// `Valid` condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
