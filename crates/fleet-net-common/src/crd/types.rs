//! Supporting types shared by the fleet networking CRDs

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
///
/// Mirrors `metav1.Condition`, including `observedGeneration`, which the
/// equality helpers in [`crate::condition`] rely on.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Valid, Conflict, Joined)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the object this condition was computed from
    #[serde(rename = "observedGeneration", default)]
    pub observed_generation: i64,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation,
            last_transition_time: Utc::now(),
        }
    }
}

/// A port exposed by an exported Service
///
/// Two claims agree on a Service only when their port lists are equal
/// element by element, in order.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    /// Port name; required when a Service has more than one port
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// IP protocol (TCP, UDP, SCTP)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    /// Application protocol hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,

    /// Port exposed by the Service
    pub port: i32,

    /// Port or named port on the backing pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,
}

impl ServicePort {
    /// Convert a core Service port into an exported port
    pub fn from_service_port(port: &k8s_openapi::api::core::v1::ServicePort) -> Self {
        Self {
            name: port.name.clone().unwrap_or_default(),
            protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            app_protocol: port.app_protocol.clone(),
            port: port.port,
            target_port: port.target_port.clone(),
        }
    }
}

/// A member cluster contributing to a ServiceImport
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ClusterStatus {
    /// Member cluster ID
    pub cluster: String,
}

impl ClusterStatus {
    /// Create a cluster status entry
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }
}

/// Reference to an object exported from a member cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportedObjectReference {
    /// ID of the member cluster the object lives in
    pub cluster_id: String,

    /// API version of the exported object
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,

    /// Kind of the exported object
    pub kind: String,

    /// Namespace of the exported object
    pub namespace: String,

    /// Name of the exported object
    pub name: String,

    /// Resource version of the object when last exported
    #[serde(default)]
    pub resource_version: String,

    /// Generation of the object when last exported
    #[serde(default)]
    pub generation: i64,

    /// UID of the exported object
    #[serde(default)]
    pub uid: String,

    /// `{namespace}/{name}`; indexed on the hub to find all claims for a Service
    pub namespaced_name: String,

    /// When the current spec of the object was first seen for export
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_since: Option<DateTime<Utc>>,
}

impl ExportedObjectReference {
    /// Build a reference from the object's metadata
    pub fn from_meta(
        cluster_id: &str,
        api_version: &str,
        kind: &str,
        meta: &kube::api::ObjectMeta,
        exported_since: DateTime<Utc>,
    ) -> Self {
        let namespace = meta.namespace.clone().unwrap_or_default();
        let name = meta.name.clone().unwrap_or_default();
        Self {
            cluster_id: cluster_id.to_string(),
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespaced_name: format!("{namespace}/{name}"),
            namespace,
            name,
            resource_version: meta.resource_version.clone().unwrap_or_default(),
            generation: meta.generation.unwrap_or_default(),
            uid: meta.uid.clone().unwrap_or_default(),
            exported_since: Some(exported_since),
        }
    }

    /// Refresh the version-tracking fields from newer metadata
    pub fn update_from_meta(&mut self, meta: &kube::api::ObjectMeta, exported_since: DateTime<Utc>) {
        self.resource_version = meta.resource_version.clone().unwrap_or_default();
        self.generation = meta.generation.unwrap_or_default();
        self.exported_since = Some(exported_since);
    }
}
