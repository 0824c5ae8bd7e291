//! Azure Traffic Manager API surface
//!
//! The reconcilers only need Get/CreateOrUpdate/Delete on two resource kinds,
//! profiles and Azure endpoints. [`TrafficManagerApi`] is that seam; the
//! production implementation is [`crate::arm::ArmTrafficManagerClient`] and
//! every call goes through [`MeteredTrafficManagerApi`] so its latency is
//! recorded.
//!
//! The model types follow the ARM JSON shape so they serialize directly as
//! request and response bodies. Fields Azure may omit are optional.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use fleet_net_common::metrics::ApiTimer;
use fleet_net_common::{Error, ErrorKind, Result};

/// `profileStatus` of an enabled profile
pub const PROFILE_STATUS_ENABLED: &str = "Enabled";

/// Weighted round-robin routing
pub const ROUTING_METHOD_WEIGHTED: &str = "Weighted";

/// `endpointStatus` of an enabled endpoint
pub const ENDPOINT_STATUS_ENABLED: &str = "Enabled";

/// Resource type of an Azure endpoint
pub const AZURE_ENDPOINT_TYPE: &str = "Microsoft.Network/trafficManagerProfiles/azureEndpoints";

/// Resource type label for profile calls
pub const RESOURCE_PROFILE: &str = "profile";

/// Resource type label for endpoint calls
pub const RESOURCE_ENDPOINT: &str = "endpoint";

/// A Traffic Manager profile
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Azure resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Profile name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Always `global` for Traffic Manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Resource tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Profile properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<ProfileProperties>,
}

/// Properties of a profile
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileProperties {
    /// Enabled or Disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_status: Option<String>,
    /// Routing method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_routing_method: Option<String>,
    /// DNS settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_config: Option<DnsConfig>,
    /// Endpoint health probing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_config: Option<ProfileMonitorConfig>,
    /// Endpoints attached to the profile
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
}

/// DNS settings of a profile
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    /// Label under `trafficmanager.net`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_name: Option<String>,
    /// Fully qualified name, set by Azure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    /// DNS TTL in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

/// Health probe settings of a profile
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileMonitorConfig {
    /// HTTP, HTTPS or TCP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Probe port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    /// Probe path for HTTP(S)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Probe interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_in_seconds: Option<i64>,
    /// Probe timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_in_seconds: Option<i64>,
    /// Failures tolerated before an endpoint is degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_number_of_failures: Option<i64>,
}

/// A Traffic Manager endpoint
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Azure resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Endpoint name; Azure treats it case-insensitively
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Endpoint resource type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Endpoint properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<EndpointProperties>,
}

/// Properties of an endpoint
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointProperties {
    /// Public IP the endpoint routes to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_resource_id: Option<String>,
    /// FQDN of the target, set by Azure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Enabled or Disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_status: Option<String>,
    /// Routing weight (1 to 1000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
}

/// Operations the Traffic Manager reconcilers need
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TrafficManagerApi: Send + Sync {
    /// Read a profile including its endpoints
    async fn get_profile(&self, resource_group: &str, name: &str) -> Result<Profile>;

    /// Create or replace a profile; `profile.name` must be set
    async fn create_or_update_profile(&self, resource_group: &str, profile: &Profile) -> Result<Profile>;

    /// Delete a profile and its endpoints
    async fn delete_profile(&self, resource_group: &str, name: &str) -> Result<()>;

    /// Create or replace an Azure endpoint of a profile; `endpoint.name` must be set
    async fn create_or_update_endpoint(
        &self,
        resource_group: &str,
        profile: &str,
        endpoint: &Endpoint,
    ) -> Result<Endpoint>;

    /// Delete an Azure endpoint of a profile
    async fn delete_endpoint(&self, resource_group: &str, profile: &str, endpoint: &str) -> Result<()>;
}

/// Classify an HTTP status returned by Azure
pub fn error_kind_for_status(status: u16) -> ErrorKind {
    match status {
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        401 | 403 => ErrorKind::Forbidden,
        408 | 504 => ErrorKind::Timeout,
        429 => ErrorKind::TooManyRequests,
        503 => ErrorKind::ServerTimeout,
        400..=499 => ErrorKind::Invalid,
        _ => ErrorKind::Other,
    }
}

/// A 4xx rejection other than throttling: retrying the same request will not help
pub fn is_client_error(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotFound
            | ErrorKind::Conflict
            | ErrorKind::AlreadyExists
            | ErrorKind::Invalid
            | ErrorKind::Forbidden
    )
}

/// Records `{operation, success, resource_type}` latency for every call
pub struct MeteredTrafficManagerApi<A> {
    inner: A,
}

impl<A> MeteredTrafficManagerApi<A> {
    /// Wrap an API implementation
    pub fn new(inner: A) -> Self {
        Self { inner }
    }
}

/// NotFound is an expected answer, so it counts as a successful call
fn succeeded<T>(result: &Result<T>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => e.is_not_found(),
    }
}

#[async_trait]
impl<A: TrafficManagerApi> TrafficManagerApi for MeteredTrafficManagerApi<A> {
    async fn get_profile(&self, resource_group: &str, name: &str) -> Result<Profile> {
        let timer = ApiTimer::start("get", RESOURCE_PROFILE);
        let result = self.inner.get_profile(resource_group, name).await;
        timer.complete(succeeded(&result));
        result
    }

    async fn create_or_update_profile(&self, resource_group: &str, profile: &Profile) -> Result<Profile> {
        let timer = ApiTimer::start("create_or_update", RESOURCE_PROFILE);
        let result = self.inner.create_or_update_profile(resource_group, profile).await;
        timer.complete(result.is_ok());
        result
    }

    async fn delete_profile(&self, resource_group: &str, name: &str) -> Result<()> {
        let timer = ApiTimer::start("delete", RESOURCE_PROFILE);
        let result = self.inner.delete_profile(resource_group, name).await;
        timer.complete(succeeded(&result));
        result
    }

    async fn create_or_update_endpoint(
        &self,
        resource_group: &str,
        profile: &str,
        endpoint: &Endpoint,
    ) -> Result<Endpoint> {
        let timer = ApiTimer::start("create_or_update", RESOURCE_ENDPOINT);
        let result = self
            .inner
            .create_or_update_endpoint(resource_group, profile, endpoint)
            .await;
        timer.complete(result.is_ok());
        result
    }

    async fn delete_endpoint(&self, resource_group: &str, profile: &str, endpoint: &str) -> Result<()> {
        let timer = ApiTimer::start("delete", RESOURCE_ENDPOINT);
        let result = self.inner.delete_endpoint(resource_group, profile, endpoint).await;
        timer.complete(succeeded(&result));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_classified() {
        assert_eq!(error_kind_for_status(404), ErrorKind::NotFound);
        assert_eq!(error_kind_for_status(409), ErrorKind::Conflict);
        assert_eq!(error_kind_for_status(400), ErrorKind::Invalid);
        assert_eq!(error_kind_for_status(403), ErrorKind::Forbidden);
        assert_eq!(error_kind_for_status(429), ErrorKind::TooManyRequests);
        assert_eq!(error_kind_for_status(500), ErrorKind::Other);
    }

    #[test]
    fn throttling_is_not_a_client_error() {
        let throttled = Error::traffic_manager(ErrorKind::TooManyRequests, RESOURCE_PROFILE, "slow down");
        let invalid = Error::traffic_manager(ErrorKind::Invalid, RESOURCE_PROFILE, "bad monitor path");
        let server = Error::traffic_manager(ErrorKind::Other, RESOURCE_PROFILE, "internal error");
        assert!(!is_client_error(&throttled));
        assert!(is_client_error(&invalid));
        assert!(!is_client_error(&server));
    }

    #[test]
    fn profile_uses_arm_field_names() {
        let profile = Profile {
            name: Some("fleet-abc".to_string()),
            properties: Some(ProfileProperties {
                dns_config: Some(DnsConfig {
                    relative_name: Some("work-shop".to_string()),
                    ttl: Some(60),
                    fqdn: None,
                }),
                endpoints: vec![Endpoint {
                    type_: Some(AZURE_ENDPOINT_TYPE.to_string()),
                    properties: Some(EndpointProperties {
                        target_resource_id: Some("/subscriptions/s/pip".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["properties"]["dnsConfig"]["relativeName"], "work-shop");
        assert_eq!(json["properties"]["endpoints"][0]["type"], AZURE_ENDPOINT_TYPE);
        assert_eq!(
            json["properties"]["endpoints"][0]["properties"]["targetResourceId"],
            "/subscriptions/s/pip"
        );
        assert!(json.get("tags").is_none());
    }

    #[tokio::test]
    async fn metered_api_delegates() {
        let mut inner = MockTrafficManagerApi::new();
        inner
            .expect_delete_endpoint()
            .withf(|rg, profile, endpoint| rg == "rg" && profile == "fleet-p" && endpoint == "e")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let api = MeteredTrafficManagerApi::new(inner);
        api.delete_endpoint("rg", "fleet-p", "e").await.unwrap();
    }
}
