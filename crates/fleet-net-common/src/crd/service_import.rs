//! ServiceImport CRD: the resolved, fleet-wide view of an exported Service

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClusterStatus, ServicePort};

/// ServiceImport is created on the hub for every exported Service name.
///
/// Its status stays empty until conflict resolution picks a winning port
/// spec; the object is deleted once no claims remain.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "ServiceImport",
    namespaced,
    status = "ServiceImportStatus",
    shortname = "svcimport",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".status.type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ServiceImportSpec {}

/// How a ServiceImport is exposed to importing clusters
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ServiceImportType {
    /// A single virtual IP for the whole cluster set
    #[default]
    ClusterSetIP,
    /// No virtual IP; endpoints are addressed directly
    Headless,
}

/// Status of a ServiceImport
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportStatus {
    /// Virtual IPs assigned to the import
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,

    /// Exposure type; unset until resolved
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<ServiceImportType>,

    /// Winning port spec
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,

    /// Clusters whose exports agree with the winning port spec
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterStatus>,
}

impl ServiceImportStatus {
    /// The winning spec has not been chosen yet
    pub fn is_unresolved(&self) -> bool {
        self.clusters.is_empty()
    }
}

impl ServiceImport {
    /// Status clusters, or empty when no status has been written
    pub fn clusters(&self) -> &[ClusterStatus] {
        self.status.as_ref().map(|s| s.clusters.as_slice()).unwrap_or_default()
    }

    /// Status ports, or empty when no status has been written
    pub fn ports(&self) -> &[ServicePort] {
        self.status.as_ref().map(|s| s.ports.as_slice()).unwrap_or_default()
    }
}
