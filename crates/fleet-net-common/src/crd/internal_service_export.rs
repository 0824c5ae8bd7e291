//! InternalServiceExport CRD: the hub-side claim that one member cluster exports a Service
//!
//! One claim exists per (member cluster, exported Service), in the member's
//! reserved hub namespace, named `{namespace}-{name}` after the Service.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ExportedObjectReference, ServicePort};

/// InternalServiceExport carries one cluster's view of an exported Service.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "InternalServiceExport",
    namespaced,
    status = "InternalServiceExportStatus",
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.serviceReference.namespacedName"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.serviceReference.clusterId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InternalServiceExportSpec {
    /// Ports of the exported Service
    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// The exported Service in its member cluster
    pub service_reference: ExportedObjectReference,

    /// Service type (ClusterIP, LoadBalancer, ...); set when Traffic Manager is enabled
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// The Service is fronted by an internal load balancer
    #[serde(default)]
    pub is_internal_load_balancer: bool,

    /// Azure resource ID of the public IP fronting the Service
    #[serde(default, rename = "publicIPResourceID", skip_serializing_if = "Option::is_none")]
    pub public_ip_resource_id: Option<String>,

    /// The public IP has a DNS label, a Traffic Manager requirement
    #[serde(default, rename = "isDNSLabelConfigured")]
    pub is_dns_label_configured: bool,

    /// Traffic Manager weight of this export
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
}

/// Status of an InternalServiceExport
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InternalServiceExportStatus {
    /// Conflict resolution result (`Conflict` condition)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
