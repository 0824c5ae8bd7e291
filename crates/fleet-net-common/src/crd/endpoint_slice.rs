//! EndpointSliceExport / EndpointSliceImport CRDs
//!
//! An EndpointSliceExport is the hub copy of a member's EndpointSlice; an
//! EndpointSliceImport is its fan-out into each importing member. Both carry
//! the same spec.

use k8s_openapi::api::discovery::v1::EndpointPort;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ExportedObjectReference;

/// Spec shared by EndpointSliceExport and EndpointSliceImport
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "EndpointSliceExport",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSliceExportSpec {
    /// Address type of the endpoints (IPv4, IPv6, FQDN)
    pub address_type: String,

    /// Exported endpoints
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    /// Ports exposed by the endpoints
    #[serde(default)]
    pub ports: Vec<EndpointPort>,

    /// The EndpointSlice in its member cluster
    pub endpoint_slice_reference: ExportedObjectReference,
}

/// EndpointSliceImport spec; identical in shape to the export it was fanned out from
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "EndpointSliceImport",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSliceImportSpec {
    /// Address type of the endpoints (IPv4, IPv6, FQDN)
    pub address_type: String,

    /// Imported endpoints
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    /// Ports exposed by the endpoints
    #[serde(default)]
    pub ports: Vec<EndpointPort>,

    /// The EndpointSlice in its origin member cluster
    pub endpoint_slice_reference: ExportedObjectReference,
}

/// A single exported endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Endpoint {
    /// Endpoint addresses
    pub addresses: Vec<String>,
}
