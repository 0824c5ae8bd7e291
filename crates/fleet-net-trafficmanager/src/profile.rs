//! TrafficManagerProfile controller
//!
//! Keeps one Azure Traffic Manager profile, named `fleet-{uid}`, in line
//! with each TrafficManagerProfile and reports the outcome through the
//! `Programmed` condition.
//!
//! Two finalizers are used. The metrics finalizer is added first. The
//! profile finalizer is only added right before the first create call, so a
//! profile that was never created in Azure (wrong resource group, missing
//! permissions) can still be deleted.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use fleet_net_common::condition::set_status_condition;
use fleet_net_common::crd::{
    traffic_manager_reasons as reasons, Condition, ConditionStatus, TrafficManagerProfile,
    PROFILE_CONDITION_PROGRAMMED,
};
use fleet_net_common::kube_utils::{add_finalizer, has_finalizer, is_deleting, remove_finalizer};
use fleet_net_common::metrics::observe_reconcile;
use fleet_net_common::naming::{traffic_manager_dns_relative_name, traffic_manager_profile_name};
use fleet_net_common::retry::retry_on_transient;
use fleet_net_common::store::{ObjectKey, SharedStore};
use fleet_net_common::{
    Error, ErrorKind, FleetConfig, Result, METRICS_FINALIZER, TRAFFIC_MANAGER_PROFILE_FINALIZER,
    TRAFFIC_MANAGER_PROFILE_TAG_KEY,
};

use crate::api::{
    is_client_error, DnsConfig, Profile, ProfileMonitorConfig, ProfileProperties, TrafficManagerApi,
    PROFILE_STATUS_ENABLED, ROUTING_METHOD_WEIGHTED,
};

/// Controller name used for metrics and logs
pub const CONTROLLER_NAME: &str = "trafficmanagerprofile";

/// Location of every Traffic Manager profile
pub const PROFILE_LOCATION: &str = "global";

/// DNS TTL of created profiles, the Azure portal default
pub const DEFAULT_DNS_TTL: i64 = 60;

/// Shared context for the profile controller
pub struct ProfileContext {
    /// TrafficManagerProfiles in the hub
    pub profiles: SharedStore<TrafficManagerProfile>,
    /// Azure Traffic Manager
    pub api: Arc<dyn TrafficManagerApi>,
    /// Runtime configuration
    pub config: Arc<FleetConfig>,
    /// Fires on shutdown
    pub token: CancellationToken,
}

impl ProfileContext {
    async fn write(&self, profile: &TrafficManagerProfile) -> Result<TrafficManagerProfile> {
        retry_on_transient(
            &self.config.write_retry,
            &self.token,
            "update TrafficManagerProfile",
            || self.profiles.update(profile),
        )
        .await
    }
}

/// Reconcile one TrafficManagerProfile
#[instrument(skip(profile, ctx), fields(traffic_manager_profile = %ObjectKey::of(profile.as_ref())))]
pub async fn reconcile(profile: Arc<TrafficManagerProfile>, ctx: Arc<ProfileContext>) -> Result<Action> {
    let key = ObjectKey::of(profile.as_ref());
    observe_reconcile(CONTROLLER_NAME, reconcile_profile(&key, &ctx)).await
}

async fn reconcile_profile(key: &ObjectKey, ctx: &ProfileContext) -> Result<Action> {
    let mut profile = match ctx.profiles.get(key).await {
        Ok(profile) => profile,
        Err(e) if e.is_not_found() => {
            debug!("TrafficManagerProfile is gone");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    if is_deleting(&profile) {
        return delete_profile(ctx, profile).await;
    }

    if add_finalizer(&mut profile, METRICS_FINALIZER) {
        profile = ctx.write(&profile).await?;
    }
    program_profile(ctx, profile).await
}

async fn program_profile(ctx: &ProfileContext, mut profile: TrafficManagerProfile) -> Result<Action> {
    let name = traffic_manager_profile_name(&profile.uid().unwrap_or_default());
    let resource_group = profile.spec.resource_group.clone();
    let mut desired = desired_profile(&profile, &name);

    match ctx.api.get_profile(&resource_group, &name).await {
        Ok(current) => {
            if equal_profile(&current, &desired) {
                debug!(profile = %name, "Azure profile is up to date");
                return update_status(ctx, profile, Ok(current)).await;
            }
            desired = merge_profile(current, desired);
        }
        Err(e) if e.is_not_found() => {
            debug!(profile = %name, "Azure profile does not exist yet");
        }
        Err(e) if e.kind() == ErrorKind::Forbidden => {
            // Usually a resource group that does not exist or is not ours.
            warn!(profile = %name, error = %e, "Access to the Azure profile was denied");
            return update_status(ctx, profile, Err(e)).await;
        }
        Err(e) => {
            error!(profile = %name, error = %e, "Failed to get the Azure profile");
            return Err(e);
        }
    }

    if add_finalizer(&mut profile, TRAFFIC_MANAGER_PROFILE_FINALIZER) {
        profile = ctx.write(&profile).await?;
    }

    let result = ctx.api.create_or_update_profile(&resource_group, &desired).await;
    match &result {
        Ok(_) => info!(profile = %name, "Created or updated the Azure profile"),
        Err(e) => error!(profile = %name, error = %e, "Failed to create or update the Azure profile"),
    }
    update_status(ctx, profile, result).await
}

/// The Azure profile a TrafficManagerProfile should produce
pub fn desired_profile(profile: &TrafficManagerProfile, name: &str) -> Profile {
    let mut spec = profile.spec.clone();
    spec.set_defaults();
    let mc = spec.monitor_config.unwrap_or_default();
    let namespace = profile.namespace().unwrap_or_default();

    Profile {
        id: None,
        name: Some(name.to_string()),
        location: Some(PROFILE_LOCATION.to_string()),
        tags: BTreeMap::from([(
            TRAFFIC_MANAGER_PROFILE_TAG_KEY.to_string(),
            format!("{namespace}/{}", profile.name_any()),
        )]),
        properties: Some(ProfileProperties {
            profile_status: Some(PROFILE_STATUS_ENABLED.to_string()),
            traffic_routing_method: Some(ROUTING_METHOD_WEIGHTED.to_string()),
            dns_config: Some(DnsConfig {
                relative_name: Some(traffic_manager_dns_relative_name(&namespace, &profile.name_any())),
                fqdn: None,
                ttl: Some(DEFAULT_DNS_TTL),
            }),
            monitor_config: Some(ProfileMonitorConfig {
                protocol: mc.protocol.map(|p| p.to_string()),
                port: mc.port,
                path: mc.path,
                interval_in_seconds: mc.interval_in_seconds,
                timeout_in_seconds: mc.timeout_in_seconds,
                tolerated_number_of_failures: mc.tolerated_number_of_failures,
            }),
            endpoints: Vec::new(),
        }),
    }
}

/// Compare the fields this controller manages
///
/// Location and the DNS relative name are immutable in Azure and are not
/// compared; the TTL is. Tags set by others are ignored.
pub fn equal_profile(current: &Profile, desired: &Profile) -> bool {
    let (Some(current_props), Some(desired_props)) = (&current.properties, &desired.properties) else {
        return false;
    };
    let (Some(current_mc), Some(desired_mc)) = (&current_props.monitor_config, &desired_props.monitor_config)
    else {
        return false;
    };
    let monitor_set = current_mc.interval_in_seconds.is_some()
        && current_mc.path.is_some()
        && current_mc.port.is_some()
        && current_mc.protocol.is_some()
        && current_mc.timeout_in_seconds.is_some()
        && current_mc.tolerated_number_of_failures.is_some();
    if !monitor_set || current_mc != desired_mc {
        return false;
    }

    if current_props.profile_status.is_none()
        || current_props.profile_status != desired_props.profile_status
        || current_props.traffic_routing_method.is_none()
        || current_props.traffic_routing_method != desired_props.traffic_routing_method
    {
        return false;
    }

    let current_ttl = current_props.dns_config.as_ref().and_then(|d| d.ttl);
    let desired_ttl = desired_props.dns_config.as_ref().and_then(|d| d.ttl);
    if current_ttl.is_none() || current_ttl != desired_ttl {
        return false;
    }

    desired
        .tags
        .iter()
        .all(|(key, value)| current.tags.get(key) == Some(value))
}

/// Overwrite the managed fields of `current` with `desired`, keeping everything else
pub fn merge_profile(mut current: Profile, desired: Profile) -> Profile {
    current.location = desired.location;
    current.name = desired.name;
    let desired_props = desired.properties.unwrap_or_default();
    match current.properties.as_mut() {
        None => current.properties = Some(desired_props),
        Some(props) => {
            props.dns_config = desired_props.dns_config;
            props.monitor_config = desired_props.monitor_config;
            props.profile_status = desired_props.profile_status;
            props.traffic_routing_method = desired_props.traffic_routing_method;
        }
    }
    current.tags.extend(desired.tags);
    current
}

/// `Programmed` condition for the outcome of the last Azure call
pub fn programmed_condition(profile: &TrafficManagerProfile, err: Option<&Error>) -> Condition {
    let generation = profile.metadata.generation.unwrap_or_default();
    let (status, reason, message) = match err {
        None => (
            ConditionStatus::True,
            reasons::PROGRAMMED,
            "Successfully configured the Azure Traffic Manager profile".to_string(),
        ),
        Some(e) if e.kind() == ErrorKind::Conflict => (
            ConditionStatus::False,
            reasons::DNS_NAME_NOT_AVAILABLE,
            "Domain name is not available. Please choose a different profile name or namespace"
                .to_string(),
        ),
        Some(e) if is_client_error(e) => (
            ConditionStatus::False,
            reasons::INVALID,
            format!("Invalid profile: {e}"),
        ),
        Some(e) => (
            ConditionStatus::Unknown,
            reasons::PENDING,
            format!("Failed to configure profile and retrying: {e}"),
        ),
    };
    Condition::new(PROFILE_CONDITION_PROGRAMMED, status, reason, message, generation)
}

/// Record the Azure outcome; a failed call is returned so the profile is retried
async fn update_status(
    ctx: &ProfileContext,
    mut profile: TrafficManagerProfile,
    result: Result<Profile>,
) -> Result<Action> {
    let condition = programmed_condition(&profile, result.as_ref().err());
    let status = profile.status.get_or_insert_with(Default::default);
    match &result {
        Ok(atm) => {
            status.dns_name = atm
                .properties
                .as_ref()
                .and_then(|p| p.dns_config.as_ref())
                .and_then(|d| d.fqdn.clone());
            if status.dns_name.is_none() {
                warn!("Azure returned a profile without a DNS name");
            }
            status.resource_id = atm.id.clone().unwrap_or_default();
            if status.resource_id.is_empty() {
                warn!("Azure returned a profile without a resource ID");
            }
        }
        Err(_) => {
            status.dns_name = None;
            status.resource_id = String::new();
        }
    }
    set_status_condition(&mut status.conditions, condition);

    retry_on_transient(
        &ctx.config.write_retry,
        &ctx.token,
        "update TrafficManagerProfile status",
        || ctx.profiles.update_status(&profile),
    )
    .await?;
    result.map(|_| Action::await_change())
}

async fn delete_profile(ctx: &ProfileContext, mut profile: TrafficManagerProfile) -> Result<Action> {
    let mut changed = remove_finalizer(&mut profile, METRICS_FINALIZER);

    if has_finalizer(&profile, TRAFFIC_MANAGER_PROFILE_FINALIZER) {
        let name = traffic_manager_profile_name(&profile.uid().unwrap_or_default());
        match ctx.api.delete_profile(&profile.spec.resource_group, &name).await {
            Ok(()) => info!(profile = %name, "Deleted the Azure profile"),
            Err(e) if e.is_not_found() => debug!(profile = %name, "Azure profile was already gone"),
            Err(e) => {
                error!(profile = %name, error = %e, "Failed to delete the Azure profile");
                return Err(e);
            }
        }
        remove_finalizer(&mut profile, TRAFFIC_MANAGER_PROFILE_FINALIZER);
        changed = true;
    }

    if !changed {
        return Ok(Action::await_change());
    }
    match ctx.write(&profile).await {
        Ok(_) => Ok(Action::await_change()),
        Err(e) if e.is_not_found() => Ok(Action::await_change()),
        Err(e) => Err(e),
    }
}

/// Error policy: requeue after the configured delay
pub fn error_policy(profile: Arc<TrafficManagerProfile>, error: &Error, ctx: Arc<ProfileContext>) -> Action {
    error!(
        ?error,
        traffic_manager_profile = %profile.name_any(),
        "TrafficManagerProfile reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue)
}
