//! TrafficManagerProfile and TrafficManagerBackend CRDs
//!
//! A profile maps to one Azure Traffic Manager profile; a backend attaches the
//! clusters exporting a ServiceImport to that profile as weighted endpoints.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClusterStatus, Condition};

/// Condition type on profiles: the Azure profile matches the spec
pub const PROFILE_CONDITION_PROGRAMMED: &str = "Programmed";

/// Condition type on backends: the endpoints were accepted by Traffic Manager
pub const BACKEND_CONDITION_ACCEPTED: &str = "Accepted";

/// Condition reasons used by the Traffic Manager reconcilers
pub mod reasons {
    /// Profile programmed successfully
    pub const PROGRAMMED: &str = "Programmed";
    /// Spec rejected by Azure or referring to something unusable
    pub const INVALID: &str = "Invalid";
    /// The profile DNS name is taken
    pub const DNS_NAME_NOT_AVAILABLE: &str = "DNSNameNotAvailable";
    /// Waiting on something; will be retried
    pub const PENDING: &str = "Pending";
    /// All backend endpoints accepted
    pub const ACCEPTED: &str = "Accepted";
}

/// TrafficManagerProfile configures an Azure Traffic Manager profile.
///
/// Example:
/// ```yaml
/// apiVersion: networking.fleet.azure.com/v1beta1
/// kind: TrafficManagerProfile
/// metadata:
///   name: shop
///   namespace: work
/// spec:
///   resourceGroup: fleet-rg
///   monitorConfig:
///     path: /healthz
///     protocol: HTTPS
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1beta1",
    kind = "TrafficManagerProfile",
    namespaced,
    status = "TrafficManagerProfileStatus",
    shortname = "tmp",
    printcolumn = r#"{"name":"DNS-Name","type":"string","jsonPath":".status.dnsName"}"#,
    printcolumn = r#"{"name":"Programmed","type":"string","jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficManagerProfileSpec {
    /// Azure resource group holding the profile
    pub resource_group: String,

    /// Endpoint health probing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_config: Option<MonitorConfig>,
}

/// Endpoint health probe settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Probe interval (30 or 10)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_in_seconds: Option<i64>,

    /// Probe path for HTTP(S)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Probe port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,

    /// Probe protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<MonitorProtocol>,

    /// Probe timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_in_seconds: Option<i64>,

    /// Failures tolerated before an endpoint is marked degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_number_of_failures: Option<i64>,
}

/// Health probe protocol
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MonitorProtocol {
    /// Plain HTTP
    #[default]
    HTTP,
    /// HTTPS
    HTTPS,
    /// TCP connect
    TCP,
}

impl std::fmt::Display for MonitorProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HTTP => write!(f, "HTTP"),
            Self::HTTPS => write!(f, "HTTPS"),
            Self::TCP => write!(f, "TCP"),
        }
    }
}

impl TrafficManagerProfileSpec {
    /// Fill unset monitor settings with the Azure portal defaults
    pub fn set_defaults(&mut self) {
        let mc = self.monitor_config.get_or_insert_with(MonitorConfig::default);
        let interval = *mc.interval_in_seconds.get_or_insert(30);
        mc.path.get_or_insert_with(|| "/".to_string());
        mc.port.get_or_insert(80);
        mc.protocol.get_or_insert(MonitorProtocol::HTTP);
        // timeout must stay below the interval
        mc.timeout_in_seconds
            .get_or_insert(if interval == 30 { 10 } else { 9 });
        mc.tolerated_number_of_failures.get_or_insert(3);
    }
}

/// Status of a TrafficManagerProfile
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficManagerProfileStatus {
    /// Fully qualified DNS name of the profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,

    /// Azure resource ID of the profile
    #[serde(default, rename = "resourceID", skip_serializing_if = "String::is_empty")]
    pub resource_id: String,

    /// `Programmed` condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// TrafficManagerBackend exposes a ServiceImport through a TrafficManagerProfile.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1beta1",
    kind = "TrafficManagerBackend",
    namespaced,
    status = "TrafficManagerBackendStatus",
    shortname = "tmb",
    printcolumn = r#"{"name":"Profile","type":"string","jsonPath":".spec.profile.name"}"#,
    printcolumn = r#"{"name":"Backend","type":"string","jsonPath":".spec.backend.name"}"#,
    printcolumn = r#"{"name":"Accepted","type":"string","jsonPath":".status.conditions[?(@.type==\"Accepted\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficManagerBackendSpec {
    /// Profile in the same namespace
    pub profile: NameRef,

    /// ServiceImport in the same namespace
    pub backend: NameRef,

    /// Total weight spread across the backend's endpoints (0 to 1000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
}

impl TrafficManagerBackendSpec {
    /// Weight with the default applied
    pub fn weight(&self) -> i64 {
        self.weight.unwrap_or(1)
    }
}

/// Reference to an object by name in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NameRef {
    /// Object name
    pub name: String,
}

/// Status of a TrafficManagerBackend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficManagerBackendStatus {
    /// Endpoints accepted by Traffic Manager
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<TrafficManagerEndpointStatus>,

    /// `Accepted` condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// One accepted Traffic Manager endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficManagerEndpointStatus {
    /// Lowercased endpoint name
    pub name: String,

    /// Effective endpoint weight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,

    /// Endpoint FQDN as reported by Azure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Cluster the endpoint's Service was exported from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ClusterStatus>,
}
