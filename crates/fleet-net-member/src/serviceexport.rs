//! ServiceExport controller
//!
//! Validates a user's ServiceExport against the Service it names and keeps
//! the member's claim in the hub in step with that Service. A cleanup
//! finalizer on the ServiceExport guarantees the claim is withdrawn before
//! the ServiceExport disappears.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use fleet_net_common::condition::{
    equal_condition, equal_condition_with_message, find_condition, set_status_condition,
};
use fleet_net_common::crd::{
    Condition, ConditionStatus, ExportedObjectReference, InternalServiceExport,
    InternalServiceExportSpec, ServiceExport, ServicePort, SERVICE_EXPORT_CONFLICT,
    SERVICE_EXPORT_VALID,
};
use fleet_net_common::events::{actions, reasons, EventPublisher};
use fleet_net_common::kube_utils::{
    add_finalizer, annotation, has_finalizer, is_deleting, remove_finalizer, set_annotation,
};
use fleet_net_common::metrics::observe_reconcile;
use fleet_net_common::naming::claim_name;
use fleet_net_common::retry::retry_on_transient;
use fleet_net_common::store::{ObjectKey, SharedStore};
use fleet_net_common::{
    Error, FleetConfig, Result, ANNOTATION_AZURE_LOAD_BALANCER_INTERNAL,
    ANNOTATION_LAST_SEEN_RESOURCE_VERSION, ANNOTATION_LAST_SEEN_TIMESTAMP,
    ANNOTATION_SERVICE_EXPORT_WEIGHT, SERVICE_EXPORT_CLEANUP_FINALIZER,
};

/// Controller name used for metrics and logs
pub const CONTROLLER_NAME: &str = "serviceexport";

/// Requeue delay after withdrawing a claim for a recreated Service
const REEXPORT_AFTER: Duration = Duration::from_millis(100);

/// Weight of an export without the weight annotation
pub const DEFAULT_EXPORT_WEIGHT: i64 = 1;

/// Largest accepted export weight
pub const MAX_EXPORT_WEIGHT: i64 = 1000;

// Valid and Conflict condition reasons
const REASON_SERVICE_IS_VALID: &str = "ServiceIsValid";
const REASON_SERVICE_NOT_FOUND: &str = "ServiceNotFound";
const REASON_SERVICE_INELIGIBLE: &str = "ServiceIneligible";
const REASON_PENDING_CONFLICT_RESOLUTION: &str = "ServicePendingConflictResolution";
const REASON_INVALID_WEIGHT_ANNOTATION: &str = "ServiceExportInvalidWeightAnnotation";

// =============================================================================
// Controller context
// =============================================================================

/// Shared context for the ServiceExport controller
pub struct ServiceExportContext {
    /// ServiceExports in the member cluster
    pub exports: SharedStore<ServiceExport>,
    /// Services in the member cluster
    pub services: SharedStore<Service>,
    /// This member's claims in the hub
    pub claims: SharedStore<InternalServiceExport>,
    /// Events on member ServiceExports
    pub events: Arc<dyn EventPublisher>,
    /// Runtime configuration
    pub config: Arc<FleetConfig>,
    /// Fires on shutdown
    pub token: CancellationToken,
}

impl ServiceExportContext {
    async fn write_export(&self, export: &ServiceExport) -> Result<ServiceExport> {
        retry_on_transient(
            &self.config.write_retry,
            &self.token,
            "update ServiceExport",
            || self.exports.update(export),
        )
        .await
    }

    async fn write_export_status(&self, export: &ServiceExport) -> Result<ServiceExport> {
        retry_on_transient(
            &self.config.write_retry,
            &self.token,
            "update ServiceExport status",
            || self.exports.update_status(export),
        )
        .await
    }

    async fn publish(&self, export: &ServiceExport, type_: EventType, reason: &str, note: String) {
        self.events
            .publish(&export.object_ref(&()), type_, reason, actions::EXPORT, Some(note))
            .await;
    }

    fn claim_key(&self, export: &ServiceExport) -> ObjectKey {
        ObjectKey::new(
            self.config.hub_namespace.clone(),
            claim_name(&export.namespace().unwrap_or_default(), &export.name_any()),
        )
    }
}

// =============================================================================
// Validation helpers
// =============================================================================

/// ExternalName and headless Services cannot be exported
pub fn is_service_eligible(svc: &Service) -> bool {
    let Some(spec) = svc.spec.as_ref() else {
        return true;
    };
    spec.type_.as_deref() != Some("ExternalName") && spec.cluster_ip.as_deref() != Some("None")
}

/// Traffic Manager weight from the ServiceExport annotation
pub fn export_weight(export: &ServiceExport) -> Result<i64> {
    let Some(raw) = annotation(&export.metadata, ANNOTATION_SERVICE_EXPORT_WEIGHT) else {
        return Ok(DEFAULT_EXPORT_WEIGHT);
    };
    let weight: i64 = raw.trim().parse().map_err(|_| {
        Error::validation_for(
            ANNOTATION_SERVICE_EXPORT_WEIGHT,
            format!("{raw:?} is not an integer"),
        )
    })?;
    if !(0..=MAX_EXPORT_WEIGHT).contains(&weight) {
        return Err(Error::validation_for(
            ANNOTATION_SERVICE_EXPORT_WEIGHT,
            format!("{weight} is outside 0 to {MAX_EXPORT_WEIGHT}"),
        ));
    }
    Ok(weight)
}

fn service_ports(svc: &Service) -> Vec<ServicePort> {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().map(ServicePort::from_service_port).collect())
        .unwrap_or_default()
}

fn valid_condition(export: &ServiceExport, status: ConditionStatus, reason: &str, message: String) -> Condition {
    Condition::new(
        SERVICE_EXPORT_VALID,
        status,
        reason,
        message,
        export.metadata.generation.unwrap_or_default(),
    )
}

fn export_ref(export: &ServiceExport) -> String {
    format!(
        "{}/{}",
        export.namespace().unwrap_or_default(),
        export.name_any()
    )
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a ServiceExport
#[instrument(skip(export, ctx), fields(service_export = %ObjectKey::of(export.as_ref())))]
pub async fn reconcile(export: Arc<ServiceExport>, ctx: Arc<ServiceExportContext>) -> Result<Action> {
    let key = ObjectKey::of(export.as_ref());
    observe_reconcile(CONTROLLER_NAME, reconcile_export(&key, &ctx)).await
}

async fn reconcile_export(key: &ObjectKey, ctx: &ServiceExportContext) -> Result<Action> {
    let export = match ctx.exports.get(key).await {
        Ok(export) => export,
        Err(e) if e.is_not_found() => return Ok(Action::await_change()),
        Err(e) => return Err(e),
    };

    if is_deleting(&export) {
        if has_finalizer(&export, SERVICE_EXPORT_CLEANUP_FINALIZER) {
            info!("ServiceExport is deleting, withdrawing the Service");
            unexport(ctx, export).await?;
        }
        return Ok(Action::await_change());
    }

    let svc = match ctx.services.get(key).await {
        Ok(svc) if !is_deleting(&svc) => svc,
        Ok(_) => return reject_missing_service(ctx, export).await,
        Err(e) if e.is_not_found() => return reject_missing_service(ctx, export).await,
        Err(e) => return Err(e),
    };

    if !is_service_eligible(&svc) {
        ctx.publish(
            &export,
            EventType::Warning,
            reasons::SERVICE_NOT_ELIGIBLE,
            format!("Service {} is not eligible for exporting and please check service spec", svc.name_any()),
        )
        .await;
        let export = unexport_if_exported(ctx, export).await?;
        let message = format!("service {} is not eligible for export", export_ref(&export));
        let desired = valid_condition(&export, ConditionStatus::False, REASON_SERVICE_INELIGIBLE, message);
        mark_valid_condition(ctx, export, desired, equal_condition).await?;
        return Ok(Action::await_change());
    }

    let mut weight = None;
    if ctx.config.traffic_manager_enabled {
        match export_weight(&export) {
            Ok(0) => return withdraw_zero_weight(ctx, export).await,
            Ok(w) => weight = Some(w),
            Err(e) => return reject_weight(ctx, export, e).await,
        }
    }

    let mut export = export;
    if add_finalizer(&mut export, SERVICE_EXPORT_CLEANUP_FINALIZER) {
        debug!("Adding cleanup finalizer");
        export = ctx.write_export(&export).await?;
    }
    let export = mark_export_valid(ctx, export).await?;

    let (export, exported_since) = last_seen_exported_since(ctx, export, &svc).await;
    export_service(ctx, export, &svc, exported_since, weight).await
}

async fn reject_missing_service(ctx: &ServiceExportContext, export: ServiceExport) -> Result<Action> {
    ctx.publish(
        &export,
        EventType::Warning,
        reasons::SERVICE_NOT_FOUND,
        format!("Service {} is not found or in the deleting state", export.name_any()),
    )
    .await;
    let export = unexport_if_exported(ctx, export).await?;
    let message = format!("service {} is not found", export_ref(&export));
    let desired = valid_condition(&export, ConditionStatus::False, REASON_SERVICE_NOT_FOUND, message);
    mark_valid_condition(ctx, export, desired, equal_condition).await?;
    Ok(Action::await_change())
}

/// An invalid weight keeps the current export; the user fixes the annotation
async fn reject_weight(ctx: &ServiceExportContext, export: ServiceExport, err: Error) -> Result<Action> {
    warn!(error = %err, "ServiceExport has an invalid weight annotation");
    let message = format!(
        "serviceExport {} has an invalid weight annotation, err = {err}",
        export_ref(&export)
    );
    let desired = valid_condition(&export, ConditionStatus::False, REASON_INVALID_WEIGHT_ANNOTATION, message);
    let current = export
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, SERVICE_EXPORT_VALID));
    // Annotations do not bump the generation, so the message is compared too.
    if equal_condition_with_message(current, Some(&desired)) {
        return Ok(Action::await_change());
    }
    ctx.publish(
        &export,
        EventType::Warning,
        reasons::SERVICE_EXPORT_INVALID_WEIGHT_ANNOTATION,
        format!("ServiceExport {} has invalid weight value in the annotation", export.name_any()),
    )
    .await;
    mark_valid_condition(ctx, export, desired, equal_condition_with_message).await?;
    Ok(Action::await_change())
}

async fn withdraw_zero_weight(ctx: &ServiceExportContext, export: ServiceExport) -> Result<Action> {
    info!("ServiceExport has weight 0, withdrawing the Service");
    ctx.publish(
        &export,
        EventType::Normal,
        reasons::SERVICE_EXPORT_ZERO_WEIGHT,
        format!("Service {} weight is set to 0", export.name_any()),
    )
    .await;
    let export = unexport_if_exported(ctx, export).await?;
    let message = format!("exported service {} with 0 weight", export_ref(&export));
    let desired = valid_condition(&export, ConditionStatus::True, REASON_SERVICE_IS_VALID, message);
    mark_valid_condition(ctx, export, desired, equal_condition_with_message).await?;
    Ok(Action::await_change())
}

/// Write the `Valid` condition unless `equal` says it is already in place
async fn mark_valid_condition(
    ctx: &ServiceExportContext,
    mut export: ServiceExport,
    desired: Condition,
    equal: fn(Option<&Condition>, Option<&Condition>) -> bool,
) -> Result<ServiceExport> {
    let current = export
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, SERVICE_EXPORT_VALID));
    if equal(current, Some(&desired)) {
        return Ok(export);
    }
    debug!(status = %desired.status, reason = %desired.reason, "Marking ServiceExport");
    set_status_condition(
        &mut export.status.get_or_insert_with(Default::default).conditions,
        desired,
    );
    ctx.write_export_status(&export).await
}

/// Mark `Valid=True` and, before the hub has decided, `Conflict=Unknown`
async fn mark_export_valid(ctx: &ServiceExportContext, mut export: ServiceExport) -> Result<ServiceExport> {
    let name = export_ref(&export);
    let generation = export.metadata.generation.unwrap_or_default();
    let desired = valid_condition(
        &export,
        ConditionStatus::True,
        REASON_SERVICE_IS_VALID,
        format!("service {name} is valid for export"),
    );

    let conditions = &mut export.status.get_or_insert_with(Default::default).conditions;
    let mut changed = false;
    if !equal_condition_with_message(find_condition(conditions, SERVICE_EXPORT_VALID), Some(&desired)) {
        set_status_condition(conditions, desired);
        changed = true;
    }
    if find_condition(conditions, SERVICE_EXPORT_CONFLICT).is_none() {
        set_status_condition(
            conditions,
            Condition::new(
                SERVICE_EXPORT_CONFLICT,
                ConditionStatus::Unknown,
                REASON_PENDING_CONFLICT_RESOLUTION,
                format!("service {name} is pending export conflict resolution"),
                generation,
            ),
        );
        changed = true;
    }
    if !changed {
        return Ok(export);
    }

    ctx.publish(
        &export,
        EventType::Normal,
        reasons::VALID_SERVICE_EXPORT,
        format!("Service {} is valid for export", export.name_any()),
    )
    .await;
    ctx.publish(
        &export,
        EventType::Normal,
        reasons::PENDING_EXPORT_CONFLICT_RESOLUTION,
        format!("Service {} is pending export conflict resolution", export.name_any()),
    )
    .await;
    ctx.write_export_status(&export).await
}

/// When the current Service spec was first seen, tracked in ServiceExport annotations
///
/// The annotations are refreshed whenever the Service resourceVersion moves
/// or they cannot be read back. A failed refresh is logged and `now` is used.
async fn last_seen_exported_since(
    ctx: &ServiceExportContext,
    mut export: ServiceExport,
    svc: &Service,
) -> (ServiceExport, DateTime<Utc>) {
    let now = Utc::now();
    let svc_version = svc.metadata.resource_version.clone().unwrap_or_default();
    let seen_version = annotation(&export.metadata, ANNOTATION_LAST_SEEN_RESOURCE_VERSION);
    let seen_at = annotation(&export.metadata, ANNOTATION_LAST_SEEN_TIMESTAMP)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));
    if let Some(seen_at) = seen_at {
        if seen_version == Some(svc_version.as_str()) && seen_at <= now {
            return (export, seen_at);
        }
    }

    set_annotation(&mut export.metadata, ANNOTATION_LAST_SEEN_RESOURCE_VERSION, svc_version);
    set_annotation(
        &mut export.metadata,
        ANNOTATION_LAST_SEEN_TIMESTAMP,
        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    match ctx.write_export(&export).await {
        Ok(updated) => (updated, now),
        Err(e) => {
            warn!(error = %e, "Failed to record the last seen Service version");
            (export, now)
        }
    }
}

/// Fill the Traffic Manager fields of a claim from the Service
fn apply_traffic_manager_fields(spec: &mut InternalServiceExportSpec, svc: &Service, weight: i64) {
    let type_ = svc
        .spec
        .as_ref()
        .and_then(|s| s.type_.clone())
        .unwrap_or_else(|| "ClusterIP".to_string());
    spec.is_internal_load_balancer = type_ == "LoadBalancer"
        && annotation(&svc.metadata, ANNOTATION_AZURE_LOAD_BALANCER_INTERNAL) == Some("true");
    spec.type_ = Some(type_);
    spec.weight = Some(weight);
}

/// Create or update the hub claim for a valid export
async fn export_service(
    ctx: &ServiceExportContext,
    export: ServiceExport,
    svc: &Service,
    exported_since: DateTime<Utc>,
    weight: Option<i64>,
) -> Result<Action> {
    let key = ctx.claim_key(&export);
    let existing = match ctx.claims.get(&key).await {
        Ok(claim) => Some(claim),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };

    let Some(existing) = existing else {
        let mut spec = InternalServiceExportSpec {
            ports: service_ports(svc),
            service_reference: ExportedObjectReference::from_meta(
                &ctx.config.member_cluster_name,
                "v1",
                "Service",
                &svc.metadata,
                exported_since,
            ),
            ..Default::default()
        };
        if let Some(weight) = weight {
            apply_traffic_manager_fields(&mut spec, svc, weight);
        }
        let mut claim = InternalServiceExport::new(&key.name, spec);
        claim.metadata.namespace = Some(key.namespace.clone());
        info!(claim = %key, "Exporting Service");
        retry_on_transient(
            &ctx.config.write_retry,
            &ctx.token,
            "create InternalServiceExport",
            || ctx.claims.create(&claim),
        )
        .await?;
        return Ok(Action::await_change());
    };

    let svc_uid = svc.metadata.uid.clone().unwrap_or_default();
    if existing.spec.service_reference.uid != svc_uid {
        info!(
            old_uid = %existing.spec.service_reference.uid,
            new_uid = %svc_uid,
            "Service was recreated, withdrawing the old export"
        );
        unexport(ctx, export).await?;
        return Ok(Action::requeue(REEXPORT_AFTER));
    }

    let mut claim = existing.clone();
    claim.spec.ports = service_ports(svc);
    // Keep the first-seen time while the Service version is unchanged.
    if claim.spec.service_reference.resource_version != svc.metadata.resource_version.clone().unwrap_or_default() {
        claim
            .spec
            .service_reference
            .update_from_meta(&svc.metadata, exported_since);
    }
    if let Some(weight) = weight {
        apply_traffic_manager_fields(&mut claim.spec, svc, weight);
    }
    if claim.spec == existing.spec {
        return Ok(Action::await_change());
    }

    info!(claim = %key, "Updating exported Service");
    retry_on_transient(
        &ctx.config.write_retry,
        &ctx.token,
        "update InternalServiceExport",
        || ctx.claims.update(&claim),
    )
    .await?;
    Ok(Action::await_change())
}

async fn unexport_if_exported(ctx: &ServiceExportContext, export: ServiceExport) -> Result<ServiceExport> {
    if has_finalizer(&export, SERVICE_EXPORT_CLEANUP_FINALIZER) {
        return unexport(ctx, export).await;
    }
    Ok(export)
}

/// Delete the hub claim, then release the ServiceExport
async fn unexport(ctx: &ServiceExportContext, mut export: ServiceExport) -> Result<ServiceExport> {
    let key = ctx.claim_key(&export);
    match ctx.claims.delete(&key).await {
        Ok(()) => info!(claim = %key, "Withdrew exported Service"),
        Err(e) if e.is_not_found() => debug!(claim = %key, "Claim already gone"),
        Err(e) => return Err(e),
    }

    if !remove_finalizer(&mut export, SERVICE_EXPORT_CLEANUP_FINALIZER) {
        return Ok(export);
    }
    match ctx.write_export(&export).await {
        Ok(updated) => Ok(updated),
        // Released and collected in one step.
        Err(e) if e.is_not_found() => Ok(export),
        Err(e) => Err(e),
    }
}

/// Error policy: requeue after the configured delay
pub fn error_policy(export: Arc<ServiceExport>, error: &Error, ctx: Arc<ServiceExportContext>) -> Action {
    error!(
        ?error,
        service_export = %export.name_any(),
        "ServiceExport reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue)
}
