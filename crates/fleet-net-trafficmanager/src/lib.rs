//! Azure Traffic Manager integration for the fleet networking hub
//!
//! A TrafficManagerProfile becomes an Azure Traffic Manager profile and a
//! TrafficManagerBackend turns the clusters behind a ServiceImport into
//! weighted endpoints of that profile.

#![deny(missing_docs)]

pub mod api;
pub mod arm;
pub mod backend;
pub mod profile;

pub use api::{MeteredTrafficManagerApi, TrafficManagerApi};
pub use arm::ArmTrafficManagerClient;
pub use backend::BackendContext;
pub use profile::ProfileContext;
