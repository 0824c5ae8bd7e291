//! Immutable runtime configuration
//!
//! Built once in `main` from CLI flags and passed to every controller as
//! `Arc<FleetConfig>`.

use std::time::Duration;

use crate::naming::hub_namespace;
use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Default wait for the ServiceImport resolver to settle a new claim set
pub const DEFAULT_SERVICE_IMPORT_PROCESS_TIME: Duration = Duration::from_secs(5);

/// Default requeue delay after a failed reconcile
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Configuration shared by the hub and member controllers
#[derive(Clone, Debug, PartialEq)]
pub struct FleetConfig {
    /// Name of the member cluster this agent runs for; empty on the hub
    pub member_cluster_name: String,
    /// Reserved hub namespace of the member cluster; empty on the hub
    pub hub_namespace: String,
    /// Whether exports carry Traffic Manager fields and the Traffic Manager controllers run
    pub traffic_manager_enabled: bool,
    /// Azure resource group holding the Traffic Manager profiles backends attach to
    pub traffic_manager_resource_group: String,
    /// How long a claim waits for the resolver before checking the ServiceImport again
    pub service_import_process_time: Duration,
    /// Requeue delay after a failed reconcile
    pub error_requeue: Duration,
    /// Backoff for individual writes
    pub write_retry: RetryConfig,
    /// Backoff for confirming deletes during Leave
    pub delete_wait: RetryConfig,
}

impl FleetConfig {
    /// Configuration for the hub controllers
    pub fn hub() -> Self {
        Self {
            member_cluster_name: String::new(),
            hub_namespace: String::new(),
            traffic_manager_enabled: false,
            traffic_manager_resource_group: String::new(),
            service_import_process_time: DEFAULT_SERVICE_IMPORT_PROCESS_TIME,
            error_requeue: DEFAULT_ERROR_REQUEUE,
            write_retry: RetryConfig::transient_write(),
            delete_wait: RetryConfig::delete_confirmation(),
        }
    }

    /// Configuration for the agent of one member cluster
    pub fn member(member_cluster_name: impl Into<String>) -> Result<Self> {
        let member_cluster_name = member_cluster_name.into();
        validate_cluster_name(&member_cluster_name)?;
        Ok(Self {
            hub_namespace: hub_namespace(&member_cluster_name),
            member_cluster_name,
            ..Self::hub()
        })
    }

    /// Enable or disable the Traffic Manager integration
    pub fn with_traffic_manager(mut self, enabled: bool) -> Self {
        self.traffic_manager_enabled = enabled;
        self
    }

    /// Resource group used by the TrafficManagerBackend controller
    pub fn with_traffic_manager_resource_group(mut self, resource_group: impl Into<String>) -> Self {
        self.traffic_manager_resource_group = resource_group.into();
        self
    }

    /// Override the ServiceImport processing wait
    pub fn with_service_import_process_time(mut self, wait: Duration) -> Self {
        self.service_import_process_time = wait;
        self
    }

    /// Override both retry configurations
    pub fn with_retries(mut self, write_retry: RetryConfig, delete_wait: RetryConfig) -> Self {
        self.write_retry = write_retry;
        self.delete_wait = delete_wait;
        self
    }
}

fn validate_cluster_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if !valid {
        return Err(Error::validation_for(
            "member cluster name",
            format!("{name:?} is not a valid DNS label"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_config_derives_hub_namespace() {
        let config = FleetConfig::member("bravelion").unwrap();
        assert_eq!(config.member_cluster_name, "bravelion");
        assert_eq!(config.hub_namespace, "fleet-member-bravelion");
        assert!(!config.traffic_manager_enabled);
        assert_eq!(config.write_retry, RetryConfig::transient_write());
    }

    #[test]
    fn invalid_member_names_are_rejected() {
        assert!(FleetConfig::member("").is_err());
        assert!(FleetConfig::member("Upper").is_err());
        assert!(FleetConfig::member("-lead").is_err());
        assert!(FleetConfig::member("a".repeat(64)).is_err());
    }

    #[test]
    fn builders_override_defaults() {
        let config = FleetConfig::hub()
            .with_traffic_manager(true)
            .with_service_import_process_time(Duration::from_millis(10));
        assert!(config.traffic_manager_enabled);
        assert_eq!(config.service_import_process_time, Duration::from_millis(10));
        assert!(config.member_cluster_name.is_empty());
    }
}
