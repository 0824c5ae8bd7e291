//! TrafficManagerBackend controller
//!
//! Exposes the clusters behind a ServiceImport as endpoints of the Azure
//! Traffic Manager profile created for a TrafficManagerProfile. Every
//! endpoint a backend owns carries the prefix `fleet-{backendUID}#`, so
//! several backends can share one profile without touching each other's
//! endpoints.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use fleet_net_common::condition::{
    find_condition, is_condition_status_false, is_condition_status_true, set_status_condition,
};
use fleet_net_common::crd::{
    traffic_manager_reasons as reasons, ClusterStatus, Condition, ConditionStatus,
    InternalServiceExport, ServiceImport, TrafficManagerBackend, TrafficManagerEndpointStatus,
    TrafficManagerProfile, BACKEND_CONDITION_ACCEPTED, PROFILE_CONDITION_PROGRAMMED,
};
use fleet_net_common::kube_utils::{add_finalizer, has_finalizer, is_deleting, remove_finalizer};
use fleet_net_common::metrics::observe_reconcile;
use fleet_net_common::naming::{
    traffic_manager_endpoint_name, traffic_manager_endpoint_prefix, traffic_manager_profile_name,
};
use fleet_net_common::retry::retry_on_transient;
use fleet_net_common::store::{ListQuery, ObjectKey, SharedStore, CLAIM_NAMESPACED_NAME_INDEX};
use fleet_net_common::{Error, ErrorKind, FleetConfig, Result, TRAFFIC_MANAGER_BACKEND_FINALIZER};

use crate::api::{
    is_client_error, Endpoint, EndpointProperties, Profile, TrafficManagerApi, AZURE_ENDPOINT_TYPE,
    ENDPOINT_STATUS_ENABLED,
};

/// Controller name used for metrics and logs
pub const CONTROLLER_NAME: &str = "trafficmanagerbackend";

const SERVICE_TYPE_LOAD_BALANCER: &str = "LoadBalancer";

/// Shared context for the backend controller
pub struct BackendContext {
    /// TrafficManagerBackends in the hub
    pub backends: SharedStore<TrafficManagerBackend>,
    /// TrafficManagerProfiles in the hub
    pub profiles: SharedStore<TrafficManagerProfile>,
    /// ServiceImports in the hub
    pub imports: SharedStore<ServiceImport>,
    /// Hub claims, indexed by [`CLAIM_NAMESPACED_NAME_INDEX`]
    pub claims: SharedStore<InternalServiceExport>,
    /// Azure Traffic Manager
    pub api: Arc<dyn TrafficManagerApi>,
    /// Runtime configuration
    pub config: Arc<FleetConfig>,
    /// Fires on shutdown
    pub token: CancellationToken,
}

impl BackendContext {
    fn resource_group(&self) -> &str {
        &self.config.traffic_manager_resource_group
    }

    async fn write(&self, backend: &TrafficManagerBackend) -> Result<TrafficManagerBackend> {
        retry_on_transient(
            &self.config.write_retry,
            &self.token,
            "update TrafficManagerBackend",
            || self.backends.update(backend),
        )
        .await
    }

    async fn write_status(&self, backend: &TrafficManagerBackend) -> Result<()> {
        let result = retry_on_transient(
            &self.config.write_retry,
            &self.token,
            "update TrafficManagerBackend status",
            || self.backends.update_status(backend),
        )
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Conflict => {
                info!("TrafficManagerBackend changed while updating status, skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Record a Pending condition and hand `err` back for a retry
    async fn pending_with<T>(
        &self,
        backend: &mut TrafficManagerBackend,
        message: String,
        err: Error,
    ) -> Result<T> {
        error!(error = %err, "{message}");
        set_pending(backend, message);
        self.write_status(backend).await?;
        Err(err)
    }
}

/// An endpoint this backend should have, with the cluster it serves
struct DesiredEndpoint {
    endpoint: Endpoint,
    cluster: ClusterStatus,
}

/// The claims behind a ServiceImport, split by usability
#[derive(Default)]
struct ValidatedExports {
    /// Keyed by lowercased endpoint name
    desired: BTreeMap<String, DesiredEndpoint>,
    /// Why each cluster's Service cannot be an endpoint, keyed by cluster
    invalid: BTreeMap<String, String>,
}

/// Reconcile one TrafficManagerBackend
#[instrument(skip(backend, ctx), fields(traffic_manager_backend = %ObjectKey::of(backend.as_ref())))]
pub async fn reconcile(backend: Arc<TrafficManagerBackend>, ctx: Arc<BackendContext>) -> Result<Action> {
    let key = ObjectKey::of(backend.as_ref());
    observe_reconcile(CONTROLLER_NAME, reconcile_backend(&key, &ctx)).await
}

async fn reconcile_backend(key: &ObjectKey, ctx: &BackendContext) -> Result<Action> {
    let mut backend = match ctx.backends.get(key).await {
        Ok(backend) => backend,
        Err(e) if e.is_not_found() => {
            debug!("TrafficManagerBackend is gone");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    if is_deleting(&backend) {
        return delete_backend(ctx, backend).await;
    }

    if add_finalizer(&mut backend, TRAFFIC_MANAGER_BACKEND_FINALIZER) {
        backend = ctx.write(&backend).await?;
    }

    // Each step below writes its own status when it stops the reconcile.
    // Stopping without an error waits for a watched object to change.
    let Some(profile) = validate_profile(ctx, &mut backend).await? else {
        return Ok(Action::await_change());
    };
    let Some(atm) = validate_azure_profile(ctx, &mut backend, &profile).await? else {
        return Ok(Action::await_change());
    };
    let Some(import) = validate_service_import(ctx, &mut backend, &atm).await? else {
        return Ok(Action::await_change());
    };

    if backend.spec.weight() == 0 {
        info!("Weight is 0, removing every endpoint");
        cleanup_endpoints(ctx, &backend, &atm).await?;
        set_accepted(&mut backend, Vec::new());
        ctx.write_status(&backend).await?;
        return Ok(Action::await_change());
    }

    let Some(exports) = validate_exports(ctx, &mut backend, &import).await? else {
        return Ok(Action::await_change());
    };
    let (accepted, bad) = sync_endpoints(ctx, &mut backend, &atm, exports.desired).await?;

    if exports.invalid.is_empty() && bad.is_empty() {
        set_accepted(&mut backend, accepted);
    } else {
        let message = rejection_message(&bad, &exports.invalid);
        warn!(%message, "Some exported services were not accepted");
        set_invalid(&mut backend, accepted, message);
    }
    ctx.write_status(&backend).await?;
    Ok(Action::await_change())
}

/// The TrafficManagerProfile, once it is programmed for its current generation
async fn validate_profile(
    ctx: &BackendContext,
    backend: &mut TrafficManagerBackend,
) -> Result<Option<TrafficManagerProfile>> {
    let name = backend.spec.profile.name.clone();
    let key = ObjectKey::new(backend.namespace().unwrap_or_default(), name.as_str());
    let profile = match ctx.profiles.get(&key).await {
        Ok(profile) => profile,
        Err(e) if e.is_not_found() => {
            debug!(traffic_manager_profile = %name, "TrafficManagerProfile not found");
            set_invalid(backend, Vec::new(), format!("TrafficManagerProfile {name:?} is not found"));
            ctx.write_status(backend).await?;
            return Ok(None);
        }
        Err(e) => {
            let message = format!("Failed to get the trafficManagerProfile {name:?}: {e}");
            return ctx.pending_with(backend, message, e).await;
        }
    };

    let generation = profile.metadata.generation.unwrap_or_default();
    let programmed = profile
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, PROFILE_CONDITION_PROGRAMMED));
    if is_condition_status_true(programmed, generation) {
        return Ok(Some(profile));
    }
    if is_condition_status_false(programmed, generation) {
        let reason = programmed.map(|c| c.message.as_str()).unwrap_or_default();
        let message = format!("Invalid trafficManagerProfile {name:?}: {reason}");
        set_invalid(backend, Vec::new(), message);
    } else {
        set_pending(backend, format!("In the processing of trafficManagerProfile {name:?}"));
    }
    debug!(traffic_manager_profile = %name, "TrafficManagerProfile is not programmed yet");
    ctx.write_status(backend).await?;
    Ok(None)
}

async fn validate_azure_profile(
    ctx: &BackendContext,
    backend: &mut TrafficManagerBackend,
    profile: &TrafficManagerProfile,
) -> Result<Option<Profile>> {
    let name = traffic_manager_profile_name(&profile.uid().unwrap_or_default());
    let rg = ctx.resource_group();
    match ctx.api.get_profile(rg, &name).await {
        Ok(atm) => Ok(Some(atm)),
        Err(e) if e.is_not_found() => {
            // Deleted outside the fleet, or the TrafficManagerProfile status is stale.
            error!(profile = %name, resource_group = %rg, "Azure profile not found");
            let message = format!("Azure Traffic Manager profile {name:?} under {rg:?} is not found");
            set_invalid(backend, Vec::new(), message);
            ctx.write_status(backend).await?;
            Ok(None)
        }
        Err(e) => {
            let message =
                format!("Failed to get the Azure Traffic Manager profile {name:?} under {rg:?}: {e}");
            ctx.pending_with(backend, message, e).await
        }
    }
}

/// The ServiceImport to expose; when it is gone the owned endpoints are removed
async fn validate_service_import(
    ctx: &BackendContext,
    backend: &mut TrafficManagerBackend,
    atm: &Profile,
) -> Result<Option<ServiceImport>> {
    let name = backend.spec.backend.name.clone();
    let key = ObjectKey::new(backend.namespace().unwrap_or_default(), name.as_str());
    match ctx.imports.get(&key).await {
        Ok(import) => Ok(Some(import)),
        Err(e) if e.is_not_found() => {
            info!(service_import = %name, "ServiceImport not found, removing stale endpoints");
            cleanup_endpoints(ctx, backend, atm).await?;
            set_invalid(backend, Vec::new(), format!("ServiceImport {name:?} is not found"));
            ctx.write_status(backend).await?;
            Ok(None)
        }
        Err(e) => {
            let message = format!("Failed to get the serviceImport {name:?}: {e}");
            ctx.pending_with(backend, message, e).await
        }
    }
}

/// Match each cluster of the ServiceImport with its claim
async fn validate_exports(
    ctx: &BackendContext,
    backend: &mut TrafficManagerBackend,
    import: &ServiceImport,
) -> Result<Option<ValidatedExports>> {
    if import.clusters().is_empty() {
        debug!("ServiceImport has no clusters yet");
        set_pending(backend, "In the process of exporting the services".to_string());
        ctx.write_status(backend).await?;
        return Ok(None);
    }

    let service = ObjectKey::of(import).to_string();
    let query = ListQuery::all().matching_field(CLAIM_NAMESPACED_NAME_INDEX, service.as_str());
    let claims = match ctx.claims.list(&query).await {
        Ok(claims) => claims,
        Err(e) => {
            let message = format!("Failed to list the exported service {service:?}: {e}");
            return ctx.pending_with(backend, message, e).await;
        }
    };
    let by_cluster: HashMap<String, InternalServiceExport> = claims
        .into_iter()
        .map(|c| (c.spec.service_reference.cluster_id.clone(), c))
        .collect();

    let mut exports = ValidatedExports::default();
    for cluster in import.clusters() {
        let Some(claim) = by_cluster.get(&cluster.cluster) else {
            // The ServiceImport is stale; its next update triggers another pass.
            warn!(cluster = %cluster.cluster, "No claim found for a cluster of the ServiceImport");
            let message = format!(
                "Failed to find the exported service {service:?} for {:?}",
                cluster.cluster
            );
            set_pending(backend, message);
            ctx.write_status(backend).await?;
            return Ok(None);
        };
        if let Err(reason) = validate_endpoint(claim) {
            debug!(cluster = %cluster.cluster, %reason, "Exported service cannot be a Traffic Manager endpoint");
            exports.invalid.insert(cluster.cluster.clone(), reason);
            continue;
        }
        let endpoint = desired_endpoint(backend, claim);
        let name = endpoint.name.clone().unwrap_or_default();
        exports.desired.insert(
            name,
            DesiredEndpoint {
                endpoint,
                cluster: cluster.clone(),
            },
        );
    }

    let count = exports.desired.len() as i64;
    if count > 0 {
        let weight = (backend.spec.weight() + count - 1) / count;
        for desired in exports.desired.values_mut() {
            if let Some(props) = desired.endpoint.properties.as_mut() {
                props.weight = Some(weight);
            }
        }
    }
    debug!(
        desired = exports.desired.len(),
        invalid = exports.invalid.len(),
        "Validated the exported services"
    );
    Ok(Some(exports))
}

/// Whether a claim can back an Azure endpoint
pub fn validate_endpoint(claim: &InternalServiceExport) -> std::result::Result<(), String> {
    let type_ = claim.spec.type_.as_deref().unwrap_or_default();
    if type_ != SERVICE_TYPE_LOAD_BALANCER {
        return Err(format!("unsupported service type {type_:?}"));
    }
    if claim.spec.is_internal_load_balancer {
        return Err("internal load balancer is not supported".to_string());
    }
    if !claim.spec.is_dns_label_configured {
        return Err("DNS label is not configured to the public IP".to_string());
    }
    Ok(())
}

fn desired_endpoint(backend: &TrafficManagerBackend, claim: &InternalServiceExport) -> Endpoint {
    Endpoint {
        id: None,
        name: Some(traffic_manager_endpoint_name(
            &backend.uid().unwrap_or_default(),
            &backend.spec.backend.name,
            &claim.spec.service_reference.cluster_id,
        )),
        type_: Some(AZURE_ENDPOINT_TYPE.to_string()),
        properties: Some(EndpointProperties {
            target_resource_id: claim.spec.public_ip_resource_id.clone(),
            target: None,
            endpoint_status: Some(ENDPOINT_STATUS_ENABLED.to_string()),
            weight: None,
        }),
    }
}

/// Compare the fields this controller sets; Azure fills in the rest
pub fn equal_endpoint(current: &Endpoint, desired: &Endpoint) -> bool {
    if current.type_.is_none() || current.type_ != desired.type_ {
        return false;
    }
    let (Some(current), Some(desired)) = (&current.properties, &desired.properties) else {
        return false;
    };
    let (Some(current_target), Some(desired_target)) =
        (&current.target_resource_id, &desired.target_resource_id)
    else {
        return false;
    };
    current_target.eq_ignore_ascii_case(desired_target)
        && current.weight.is_some()
        && current.weight == desired.weight
        && current.endpoint_status.is_some()
        && current.endpoint_status == desired.endpoint_status
}

fn owned_prefix(backend: &TrafficManagerBackend) -> String {
    traffic_manager_endpoint_prefix(&backend.uid().unwrap_or_default()).to_lowercase()
}

/// Bring the owned endpoints in line with `desired`
///
/// Returns the accepted endpoints and the errors of endpoints Azure rejected.
async fn sync_endpoints(
    ctx: &BackendContext,
    backend: &mut TrafficManagerBackend,
    atm: &Profile,
    mut desired: BTreeMap<String, DesiredEndpoint>,
) -> Result<(Vec<TrafficManagerEndpointStatus>, Vec<Error>)> {
    let profile_name = atm.name.clone().unwrap_or_default();
    let prefix = owned_prefix(backend);
    let existing = atm
        .properties
        .as_ref()
        .map(|p| p.endpoints.as_slice())
        .unwrap_or_default();

    let mut accepted = Vec::with_capacity(desired.len());
    for endpoint in existing {
        let Some(raw_name) = endpoint.name.as_deref() else {
            warn!(profile = %profile_name, "Azure returned an endpoint without a name");
            continue;
        };
        let name = raw_name.to_lowercase();
        if !name.starts_with(&prefix) {
            continue;
        }

        let Some(want) = desired.get(&name) else {
            match ctx.api.delete_endpoint(ctx.resource_group(), &profile_name, raw_name).await {
                Ok(()) => info!(endpoint = %name, "Deleted a stale Azure endpoint"),
                Err(e) if e.is_not_found() => debug!(endpoint = %name, "Stale Azure endpoint was already gone"),
                Err(e) => {
                    let message =
                        format!("Failed to cleanup the existing {name:?} for {profile_name:?}: {e}");
                    return ctx.pending_with(backend, message, e).await;
                }
            }
            continue;
        };
        if !equal_endpoint(endpoint, &want.endpoint) {
            continue;
        }
        if let Some(want) = desired.remove(&name) {
            debug!(endpoint = %name, "Azure endpoint is up to date");
            accepted.push(accepted_status(endpoint, want.cluster));
        }
    }

    let mut bad = Vec::new();
    for (name, want) in desired {
        match ctx
            .api
            .create_or_update_endpoint(ctx.resource_group(), &profile_name, &want.endpoint)
            .await
        {
            Ok(created) => {
                info!(endpoint = %name, "Created or updated the Azure endpoint");
                accepted.push(accepted_status(&created, want.cluster));
            }
            Err(e) if is_client_error(&e) => {
                warn!(endpoint = %name, error = %e, "Azure rejected the endpoint");
                bad.push(e);
            }
            Err(e) => {
                let message = format!("Failed to create or update {name:?} for {profile_name:?}: {e}");
                return ctx.pending_with(backend, message, e).await;
            }
        }
    }

    accepted.sort_by(|a, b| a.name.cmp(&b.name));
    Ok((accepted, bad))
}

fn accepted_status(endpoint: &Endpoint, cluster: ClusterStatus) -> TrafficManagerEndpointStatus {
    let props = endpoint.properties.as_ref();
    TrafficManagerEndpointStatus {
        name: endpoint.name.as_deref().unwrap_or_default().to_lowercase(),
        weight: props.and_then(|p| p.weight),
        target: props.and_then(|p| p.target.clone()),
        from: Some(cluster),
    }
}

/// Remove every endpoint this backend owns; the deletes run concurrently
async fn cleanup_endpoints(ctx: &BackendContext, backend: &TrafficManagerBackend, atm: &Profile) -> Result<()> {
    let Some(props) = atm.properties.as_ref() else {
        debug!("Azure profile has no properties, nothing to clean up");
        return Ok(());
    };
    let profile_name = atm.name.clone().unwrap_or_default();
    let prefix = owned_prefix(backend);

    let deletes = props
        .endpoints
        .iter()
        .filter_map(|e| e.name.as_deref())
        .filter(|name| name.to_lowercase().starts_with(&prefix))
        .map(|name| {
            let profile_name = profile_name.as_str();
            async move {
                match ctx.api.delete_endpoint(ctx.resource_group(), profile_name, name).await {
                    Ok(()) => {
                        info!(endpoint = %name, "Deleted the Azure endpoint");
                        Ok(())
                    }
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => {
                        error!(endpoint = %name, error = %e, "Failed to delete the Azure endpoint");
                        Err(e)
                    }
                }
            }
        });
    try_join_all(deletes).await.map(|_| ())
}

async fn delete_backend(ctx: &BackendContext, mut backend: TrafficManagerBackend) -> Result<Action> {
    if !has_finalizer(&backend, TRAFFIC_MANAGER_BACKEND_FINALIZER) {
        debug!("TrafficManagerBackend is being deleted");
        return Ok(Action::await_change());
    }

    delete_owned_endpoints(ctx, &backend).await?;

    remove_finalizer(&mut backend, TRAFFIC_MANAGER_BACKEND_FINALIZER);
    match ctx.write(&backend).await {
        Ok(_) => {
            info!("Removed the TrafficManagerBackend finalizer");
            Ok(Action::await_change())
        }
        Err(e) if e.is_not_found() => Ok(Action::await_change()),
        Err(e) => Err(e),
    }
}

/// Best effort: a missing profile means Azure already dropped the endpoints
async fn delete_owned_endpoints(ctx: &BackendContext, backend: &TrafficManagerBackend) -> Result<()> {
    let key = ObjectKey::new(
        backend.namespace().unwrap_or_default(),
        backend.spec.profile.name.as_str(),
    );
    let profile = match ctx.profiles.get(&key).await {
        Ok(profile) => profile,
        Err(e) if e.is_not_found() => {
            debug!(traffic_manager_profile = %key, "TrafficManagerProfile is gone, no endpoints to delete");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let name = traffic_manager_profile_name(&profile.uid().unwrap_or_default());
    match ctx.api.get_profile(ctx.resource_group(), &name).await {
        Ok(atm) => cleanup_endpoints(ctx, backend, &atm).await,
        Err(e) if e.is_not_found() => {
            debug!(profile = %name, "Azure profile is gone, no endpoints to delete");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// =============================================================================
// Status
// =============================================================================

fn set_condition(
    backend: &mut TrafficManagerBackend,
    status: ConditionStatus,
    reason: &str,
    message: String,
    endpoints: Vec<TrafficManagerEndpointStatus>,
) {
    let generation = backend.metadata.generation.unwrap_or_default();
    let backend_status = backend.status.get_or_insert_with(Default::default);
    backend_status.endpoints = endpoints;
    set_status_condition(
        &mut backend_status.conditions,
        Condition::new(BACKEND_CONDITION_ACCEPTED, status, reason, message, generation),
    );
}

fn set_accepted(backend: &mut TrafficManagerBackend, endpoints: Vec<TrafficManagerEndpointStatus>) {
    let message = format!(
        "{} service(s) exported from clusters have been accepted as Traffic Manager endpoints",
        endpoints.len()
    );
    set_condition(backend, ConditionStatus::True, reasons::ACCEPTED, message, endpoints);
}

fn set_invalid(backend: &mut TrafficManagerBackend, endpoints: Vec<TrafficManagerEndpointStatus>, message: String) {
    set_condition(backend, ConditionStatus::False, reasons::INVALID, message, endpoints);
}

fn set_pending(backend: &mut TrafficManagerBackend, message: String) {
    set_condition(backend, ConditionStatus::Unknown, reasons::PENDING, message, Vec::new());
}

/// Summarise rejected endpoints and unusable services, one example of each
fn rejection_message(bad: &[Error], invalid: &BTreeMap<String, String>) -> String {
    let mut message = String::new();
    if let Some(first) = bad.first() {
        message.push_str(&format!(
            "{} endpoint(s) failed to be created/updated in the Azure Traffic Manager, for example, {first}; ",
            bad.len()
        ));
    }
    if let Some((cluster, reason)) = invalid.iter().next() {
        message.push_str(&format!(
            "{} service(s) exported from clusters cannot be exposed as the Azure Traffic Manager, for example, service exported from {cluster} is invalid: {reason}",
            invalid.len()
        ));
    }
    message
}

/// Error policy: requeue after the configured delay
pub fn error_policy(backend: Arc<TrafficManagerBackend>, error: &Error, ctx: Arc<BackendContext>) -> Action {
    error!(
        ?error,
        traffic_manager_backend = %backend.name_any(),
        "TrafficManagerBackend reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue)
}
