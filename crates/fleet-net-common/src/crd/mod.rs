//! Custom Resource Definitions for fleet networking
//!
//! This module contains all CRD definitions used by the hub and member agents.

mod endpoint_slice;
mod internal_member_cluster;
mod internal_service_export;
mod multi_cluster_service;
mod service_export;
mod service_import;
mod traffic_manager;
mod types;

pub use endpoint_slice::{
    Endpoint, EndpointSliceExport, EndpointSliceExportSpec, EndpointSliceImport,
    EndpointSliceImportSpec,
};
pub use internal_member_cluster::{
    AgentStatus, AgentType, ClusterState, InternalMemberCluster, InternalMemberClusterSpec,
    InternalMemberClusterStatus, AGENT_JOINED,
};
pub use internal_service_export::{
    InternalServiceExport, InternalServiceExportSpec, InternalServiceExportStatus,
};
pub use multi_cluster_service::{
    MultiClusterService, MultiClusterServiceSpec, MultiClusterServiceStatus, ServiceImportRef,
};
pub use service_export::{
    ServiceExport, ServiceExportSpec, ServiceExportStatus, SERVICE_EXPORT_CONFLICT,
    SERVICE_EXPORT_VALID,
};
pub use service_import::{ServiceImport, ServiceImportSpec, ServiceImportStatus, ServiceImportType};
pub use traffic_manager::{
    reasons as traffic_manager_reasons, MonitorConfig, MonitorProtocol, NameRef,
    TrafficManagerBackend, TrafficManagerBackendSpec, TrafficManagerBackendStatus,
    TrafficManagerEndpointStatus, TrafficManagerProfile, TrafficManagerProfileSpec,
    TrafficManagerProfileStatus, BACKEND_CONDITION_ACCEPTED, PROFILE_CONDITION_PROGRAMMED,
};
pub use types::{
    ClusterStatus, Condition, ConditionStatus, ExportedObjectReference, ServicePort,
};
