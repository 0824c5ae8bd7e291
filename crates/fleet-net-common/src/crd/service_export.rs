//! ServiceExport CRD: a user's request to export a Service to the fleet
//!
//! Lives in the member cluster next to the Service it exports (same
//! namespace and name).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Condition type reporting whether the Service can be exported
pub const SERVICE_EXPORT_VALID: &str = "Valid";

/// Condition type reporting whether this export agrees with other clusters' exports
pub const SERVICE_EXPORT_CONFLICT: &str = "Conflict";

/// ServiceExport marks a Service for export to the fleet.
///
/// Example:
/// ```yaml
/// apiVersion: networking.fleet.azure.com/v1alpha1
/// kind: ServiceExport
/// metadata:
///   name: nginx
///   namespace: work
/// spec: {}
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "ServiceExport",
    namespaced,
    status = "ServiceExportStatus",
    shortname = "svcexport",
    printcolumn = r#"{"name":"Valid","type":"string","jsonPath":".status.conditions[?(@.type==\"Valid\")].status"}"#,
    printcolumn = r#"{"name":"Conflict","type":"string","jsonPath":".status.conditions[?(@.type==\"Conflict\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ServiceExportSpec {}

/// Status of a ServiceExport
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportStatus {
    /// `Valid` and `Conflict` conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
