//! Common types for fleet networking: CRDs, errors, object store and utilities

#![deny(missing_docs)]

pub mod condition;
pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod naming;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use config::FleetConfig;
pub use error::{Error, ErrorKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for fleet networking resources
pub const NETWORKING_GROUP: &str = "networking.fleet.azure.com";

/// Finalizer on InternalServiceExport claims; guarantees the hub records the
/// removal of a claim before the object goes away
pub const INTERNAL_SERVICE_EXPORT_FINALIZER: &str =
    "networking.fleet.azure.com/internal-svc-export-cleanup";

/// Finalizer on member ServiceExports; guarantees the hub claim is withdrawn
pub const SERVICE_EXPORT_CLEANUP_FINALIZER: &str = "networking.fleet.azure.com/svc-export-cleanup";

/// Finalizer used to clean up per-object metric series
pub const METRICS_FINALIZER: &str = "networking.fleet.azure.com/metrics-cleanup";

/// Finalizer guarding deletion of the Azure Traffic Manager profile
pub const TRAFFIC_MANAGER_PROFILE_FINALIZER: &str =
    "networking.fleet.azure.com/traffic-manager-profile-cleanup";

/// Finalizer guarding deletion of Azure Traffic Manager endpoints owned by a backend
pub const TRAFFIC_MANAGER_BACKEND_FINALIZER: &str =
    "networking.fleet.azure.com/traffic-manager-backend-cleanup";

/// Annotation recording the exported Service generation last observed by the export latency metric
pub const ANNOTATION_LAST_OBSERVED_GENERATION: &str =
    "networking.fleet.azure.com/last-observed-generation";

/// Annotation recording the Service resourceVersion last seen by the ServiceExport controller
pub const ANNOTATION_LAST_SEEN_RESOURCE_VERSION: &str =
    "networking.fleet.azure.com/last-seen-resource-version";

/// Annotation recording when the last seen Service resourceVersion was first observed (RFC 3339)
pub const ANNOTATION_LAST_SEEN_TIMESTAMP: &str = "networking.fleet.azure.com/last-seen-timestamp";

/// Annotation on a ServiceExport carrying its Traffic Manager weight
pub const ANNOTATION_SERVICE_EXPORT_WEIGHT: &str = "networking.fleet.azure.com/weight";

/// Service annotation marking an Azure internal load balancer
pub const ANNOTATION_AZURE_LOAD_BALANCER_INTERNAL: &str =
    "service.beta.kubernetes.io/azure-load-balancer-internal";

/// Tag key stamped on Azure Traffic Manager profiles created by the hub
pub const TRAFFIC_MANAGER_PROFILE_TAG_KEY: &str = "networking.fleet.azure.com.trafficManagerProfile";
