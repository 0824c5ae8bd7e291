//! Azure Resource Manager client for Traffic Manager
//!
//! Talks to the `Microsoft.Network/trafficmanagerprofiles` REST API. The
//! bearer token is read from a file on every call so that an external
//! process (workload identity sidecar, CSI driver) can rotate it.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_net_common::{Error, ErrorKind, Result};

use crate::api::{
    error_kind_for_status, Endpoint, Profile, TrafficManagerApi, RESOURCE_ENDPOINT, RESOURCE_PROFILE,
};

/// Public Azure cloud
pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";

/// Traffic Manager API version
pub const API_VERSION: &str = "2022-04-01";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Traffic Manager over the ARM REST API
pub struct ArmTrafficManagerClient {
    http: reqwest::Client,
    endpoint: String,
    subscription_id: String,
    token_file: PathBuf,
}

#[derive(Deserialize)]
struct ArmErrorResponse {
    error: ArmError,
}

#[derive(Deserialize)]
struct ArmError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl ArmTrafficManagerClient {
    /// Client for `subscription_id` authenticating with the token in `token_file`
    pub fn new(
        endpoint: impl Into<String>,
        subscription_id: impl Into<String>,
        token_file: impl Into<PathBuf>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("traffic manager client", e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            subscription_id: subscription_id.into(),
            token_file: token_file.into(),
        })
    }

    fn profile_url(&self, resource_group: &str, profile: &str) -> String {
        profile_url(&self.endpoint, &self.subscription_id, resource_group, profile)
    }

    fn endpoint_url(&self, resource_group: &str, profile: &str, endpoint: &str) -> String {
        format!(
            "{}/AzureEndpoints/{}",
            profile_url(&self.endpoint, &self.subscription_id, resource_group, profile),
            path_segment(endpoint)
        )
    }

    async fn token(&self) -> Result<String> {
        let token = tokio::fs::read_to_string(&self.token_file).await.map_err(|e| {
            Error::internal_with_context(
                "traffic manager client",
                format!("failed to read token from {}: {e}", self.token_file.display()),
            )
        })?;
        Ok(token.trim().to_string())
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        resource_type: &'static str,
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(self.token().await?);
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(method = %method, url, "Calling Azure Traffic Manager");
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(resource_type, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(resource_type, status, &body))
    }

    async fn send_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        resource_type: &'static str,
        body: Option<&B>,
    ) -> Result<T> {
        self.send(method, url, resource_type, body)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(resource_type, e))
    }
}

fn profile_url(endpoint: &str, subscription_id: &str, resource_group: &str, profile: &str) -> String {
    format!(
        "{endpoint}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/trafficmanagerprofiles/{}",
        path_segment(subscription_id),
        path_segment(resource_group),
        path_segment(profile)
    )
}

/// Percent-encode everything outside the RFC 3986 unreserved set
fn path_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn transport_error(resource_type: &str, e: reqwest::Error) -> Error {
    let kind = if e.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Other
    };
    Error::traffic_manager(kind, resource_type, e.to_string())
}

fn status_error(resource_type: &str, status: StatusCode, body: &str) -> Error {
    let message = match serde_json::from_str::<ArmErrorResponse>(body) {
        Ok(parsed) => format!("{} ({}): {}", status, parsed.error.code, parsed.error.message),
        Err(_) => format!("{status}: {body}"),
    };
    Error::traffic_manager(error_kind_for_status(status.as_u16()), resource_type, message)
}

#[async_trait]
impl TrafficManagerApi for ArmTrafficManagerClient {
    async fn get_profile(&self, resource_group: &str, name: &str) -> Result<Profile> {
        let url = self.profile_url(resource_group, name);
        self.send_json::<Profile, ()>(Method::GET, &url, RESOURCE_PROFILE, None)
            .await
    }

    async fn create_or_update_profile(&self, resource_group: &str, profile: &Profile) -> Result<Profile> {
        let name = profile.name.as_deref().ok_or_else(|| {
            Error::validation_for(RESOURCE_PROFILE, "profile name must be set")
        })?;
        let url = self.profile_url(resource_group, name);
        self.send_json(Method::PUT, &url, RESOURCE_PROFILE, Some(profile))
            .await
    }

    async fn delete_profile(&self, resource_group: &str, name: &str) -> Result<()> {
        let url = self.profile_url(resource_group, name);
        self.send::<()>(Method::DELETE, &url, RESOURCE_PROFILE, None)
            .await
            .map(|_| ())
    }

    async fn create_or_update_endpoint(
        &self,
        resource_group: &str,
        profile: &str,
        endpoint: &Endpoint,
    ) -> Result<Endpoint> {
        let name = endpoint.name.as_deref().ok_or_else(|| {
            Error::validation_for(RESOURCE_ENDPOINT, "endpoint name must be set")
        })?;
        let url = self.endpoint_url(resource_group, profile, name);
        self.send_json(Method::PUT, &url, RESOURCE_ENDPOINT, Some(endpoint))
            .await
    }

    async fn delete_endpoint(&self, resource_group: &str, profile: &str, endpoint: &str) -> Result<()> {
        let url = self.endpoint_url(resource_group, profile, endpoint);
        self.send::<()>(Method::DELETE, &url, RESOURCE_ENDPOINT, None)
            .await
            .map(|_| ())
    }
}
