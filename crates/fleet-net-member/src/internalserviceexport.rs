//! InternalServiceExport conflict reporter
//!
//! Runs in the member agent, watching this member's claims in the hub. It
//! copies the hub's `Conflict` decision back onto the user's ServiceExport,
//! deletes claims whose ServiceExport is gone, and observes how long an
//! export took to be resolved.

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use fleet_net_common::condition::{equal_condition, find_condition, set_status_condition};
use fleet_net_common::crd::{
    ConditionStatus, InternalServiceExport, ServiceExport, SERVICE_EXPORT_CONFLICT,
};
use fleet_net_common::events::{actions, reasons, EventPublisher};
use fleet_net_common::kube_utils::{annotation, set_annotation};
use fleet_net_common::metrics::{
    export_duration_millis, observe_reconcile, record_service_export_duration,
};
use fleet_net_common::retry::retry_on_transient;
use fleet_net_common::store::{ObjectKey, SharedStore};
use fleet_net_common::{Error, FleetConfig, Result, ANNOTATION_LAST_OBSERVED_GENERATION};

/// Controller name used for metrics and logs
pub const CONTROLLER_NAME: &str = "internalserviceexport-reporter";

/// Shared context for the conflict reporter
pub struct ReporterContext {
    /// This member's claims in the hub
    pub claims: SharedStore<InternalServiceExport>,
    /// ServiceExports in the member cluster
    pub exports: SharedStore<ServiceExport>,
    /// Events on member ServiceExports
    pub events: Arc<dyn EventPublisher>,
    /// Runtime configuration
    pub config: Arc<FleetConfig>,
    /// Fires on shutdown
    pub token: CancellationToken,
}

/// Reconcile one claim of this member
#[instrument(skip(claim, ctx), fields(claim = %ObjectKey::of(claim.as_ref())))]
pub async fn reconcile(claim: Arc<InternalServiceExport>, ctx: Arc<ReporterContext>) -> Result<Action> {
    let key = ObjectKey::of(claim.as_ref());
    observe_reconcile(CONTROLLER_NAME, report(&key, &ctx)).await
}

async fn report(key: &ObjectKey, ctx: &ReporterContext) -> Result<Action> {
    let claim = match ctx.claims.get(key).await {
        Ok(claim) => claim,
        Err(e) if e.is_not_found() => return Ok(Action::await_change()),
        Err(e) => return Err(e),
    };

    let reference = &claim.spec.service_reference;
    let export_key = ObjectKey::new(reference.namespace.clone(), reference.name.clone());
    let export = match ctx.exports.get(&export_key).await {
        Ok(export) => export,
        Err(e) if e.is_not_found() => {
            // Normally the ServiceExport finalizer withdraws the claim first.
            info!(service_export = %export_key, "ServiceExport is gone, deleting claim");
            return match ctx.claims.delete(key).await {
                Ok(()) => Ok(Action::await_change()),
                Err(e) if e.is_not_found() => Ok(Action::await_change()),
                Err(e) => Err(e),
            };
        }
        Err(e) => return Err(e),
    };

    if report_back(ctx, export, &claim).await? {
        observe_export_duration(ctx, claim).await?;
    }
    Ok(Action::await_change())
}

/// Copy the claim's `Conflict` condition onto the ServiceExport
///
/// Returns false while the hub has not decided yet.
async fn report_back(
    ctx: &ReporterContext,
    mut export: ServiceExport,
    claim: &InternalServiceExport,
) -> Result<bool> {
    let Some(decided) = claim
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, SERVICE_EXPORT_CONFLICT))
    else {
        debug!("No conflict decision to report yet");
        return Ok(false);
    };

    let mut desired = decided.clone();
    desired.observed_generation = export.metadata.generation.unwrap_or_default();
    let conditions = export
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    if equal_condition(find_condition(conditions, SERVICE_EXPORT_CONFLICT), Some(&desired)) {
        return Ok(true);
    }

    let name = export.name_any();
    let event = match desired.status {
        ConditionStatus::True => Some((
            EventType::Warning,
            reasons::SERVICE_EXPORT_CONFLICT_FOUND,
            format!("Service {name} is in conflict with other exported services"),
        )),
        ConditionStatus::False => Some((
            EventType::Normal,
            reasons::NO_SERVICE_EXPORT_CONFLICT_FOUND,
            format!("Service {name} is exported without conflict"),
        )),
        ConditionStatus::Unknown => None,
    };
    if let Some((type_, reason, note)) = event {
        ctx.events
            .publish(
                &export.object_ref(&()),
                type_,
                reason,
                actions::REPORT_BACK,
                Some(note),
            )
            .await;
    }

    info!(
        status = %desired.status,
        reason = %desired.reason,
        "Reporting conflict decision"
    );
    set_status_condition(
        &mut export.status.get_or_insert_with(Default::default).conditions,
        desired,
    );
    retry_on_transient(
        &ctx.config.write_retry,
        &ctx.token,
        "update ServiceExport status",
        || ctx.exports.update_status(&export),
    )
    .await?;
    Ok(true)
}

/// Observe the export duration once per exported Service generation
async fn observe_export_duration(ctx: &ReporterContext, mut claim: InternalServiceExport) -> Result<()> {
    let generation = claim.spec.service_reference.generation.to_string();
    if annotation(&claim.metadata, ANNOTATION_LAST_OBSERVED_GENERATION) == Some(generation.as_str()) {
        return Ok(());
    }

    // Mark first so a failed write never leads to a second observation.
    set_annotation(
        &mut claim.metadata,
        ANNOTATION_LAST_OBSERVED_GENERATION,
        generation,
    );
    retry_on_transient(
        &ctx.config.write_retry,
        &ctx.token,
        "annotate InternalServiceExport",
        || ctx.claims.update(&claim),
    )
    .await?;

    let millis = export_duration_millis(claim.spec.service_reference.exported_since, Utc::now());
    record_service_export_duration(&ctx.config.member_cluster_name, millis);
    info!(
        duration_ms = millis,
        origin_cluster = %ctx.config.member_cluster_name,
        "Observed service export duration"
    );
    Ok(())
}

/// Error policy: requeue after the configured delay
pub fn error_policy(claim: Arc<InternalServiceExport>, error: &Error, ctx: Arc<ReporterContext>) -> Action {
    error!(
        ?error,
        claim = %claim.name_any(),
        "Conflict report-back failed"
    );
    Action::requeue(ctx.config.error_requeue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fleet_net_common::condition::{
        conflicted_service_export_condition, unconflicted_service_export_condition,
    };
    use fleet_net_common::crd::{
        Condition, ExportedObjectReference, InternalServiceExportSpec,
        InternalServiceExportStatus, ServiceExportSpec, ServiceExportStatus,
    };
    use fleet_net_common::events::RecordingEventPublisher;
    use fleet_net_common::retry::RetryConfig;
    use fleet_net_common::store::{MemoryStore, ObjectStore, StoreOperation};
    use fleet_net_common::ErrorKind;

    struct Harness {
        claims: Arc<MemoryStore<InternalServiceExport>>,
        exports: Arc<MemoryStore<ServiceExport>>,
        events: Arc<RecordingEventPublisher>,
        ctx: Arc<ReporterContext>,
    }

    fn harness() -> Harness {
        let claims = Arc::new(MemoryStore::new());
        let exports = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let fast = RetryConfig {
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::transient_write()
        };
        let config = FleetConfig::member("member-1")
            .unwrap()
            .with_retries(fast.clone(), fast);
        let ctx = Arc::new(ReporterContext {
            claims: claims.clone(),
            exports: exports.clone(),
            events: events.clone(),
            config: Arc::new(config),
            token: CancellationToken::new(),
        });
        Harness {
            claims,
            exports,
            events,
            ctx,
        }
    }

    fn claim_key() -> ObjectKey {
        ObjectKey::new("fleet-member-member-1", "work-app")
    }

    fn export_key() -> ObjectKey {
        ObjectKey::new("work", "app")
    }

    fn claim(decision: Option<fn(&InternalServiceExport) -> Condition>) -> InternalServiceExport {
        let mut c = InternalServiceExport::new(
            "work-app",
            InternalServiceExportSpec {
                service_reference: ExportedObjectReference {
                    cluster_id: "member-1".to_string(),
                    kind: "Service".to_string(),
                    namespace: "work".to_string(),
                    name: "app".to_string(),
                    namespaced_name: "work/app".to_string(),
                    generation: 7,
                    exported_since: Some(Utc::now() - chrono::Duration::seconds(3)),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        c.metadata.namespace = Some("fleet-member-member-1".to_string());
        c.metadata.generation = Some(4);
        if let Some(build) = decision {
            c.status = Some(InternalServiceExportStatus {
                conditions: vec![build(&c)],
            });
        }
        c
    }

    fn export() -> ServiceExport {
        let mut e = ServiceExport::new("app", ServiceExportSpec {});
        e.metadata.namespace = Some("work".to_string());
        e.metadata.generation = Some(2);
        e
    }

    fn member_conflict(h: &Harness) -> Option<Condition> {
        h.exports
            .peek(&export_key())
            .and_then(|e| e.status)
            .and_then(|s| find_condition(&s.conditions, SERVICE_EXPORT_CONFLICT).cloned())
    }

    async fn run(h: &Harness) -> Result<Action> {
        reconcile(Arc::new(claim(None)), h.ctx.clone()).await
    }

    // ==========================================================================
    // Story Tests: Reporting the hub's decision
    // ==========================================================================

    /// Story: The hub finds a conflict and the user sees it on their ServiceExport
    #[tokio::test]
    async fn story_conflict_is_reported_with_member_generation() {
        let h = harness();
        h.claims.seed(claim(Some(conflicted_service_export_condition)));
        h.exports.seed(export());

        run(&h).await.unwrap();

        let cond = member_conflict(&h).unwrap();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, "ConflictFound");
        assert_eq!(cond.observed_generation, 2);
        assert_eq!(
            cond.message,
            "service work/app is in conflict with other exported services"
        );
        assert_eq!(h.events.reasons(), vec!["ServiceExportConflictFound"]);
        assert_eq!(
            h.events.events()[0].type_,
            EventType::Warning
        );
    }

    /// Story: Once reported, re-reconciling writes nothing
    #[tokio::test]
    async fn story_report_back_converges() {
        let h = harness();
        h.claims.seed(claim(Some(unconflicted_service_export_condition)));
        h.exports.seed(export());

        run(&h).await.unwrap();
        assert_eq!(h.events.reasons(), vec!["NoServiceExportConflictFound"]);
        let writes = h.claims.write_count() + h.exports.write_count();

        run(&h).await.unwrap();
        run(&h).await.unwrap();
        assert_eq!(h.claims.write_count() + h.exports.write_count(), writes);
        assert_eq!(h.events.events().len(), 1);
    }

    /// Story: The decision flips and the member follows
    #[tokio::test]
    async fn story_decision_change_is_reported_again() {
        let h = harness();
        h.claims.seed(claim(Some(unconflicted_service_export_condition)));
        h.exports.seed(export());
        run(&h).await.unwrap();

        let mut flipped = h.claims.peek(&claim_key()).unwrap();
        flipped.status = Some(InternalServiceExportStatus {
            conditions: vec![conflicted_service_export_condition(&flipped)],
        });
        h.claims.seed(flipped);
        run(&h).await.unwrap();

        assert_eq!(member_conflict(&h).unwrap().status, ConditionStatus::True);
        assert_eq!(
            h.events.reasons(),
            vec!["NoServiceExportConflictFound", "ServiceExportConflictFound"]
        );
    }

    /// Story: The hub has not decided yet
    #[tokio::test]
    async fn story_pending_decision_is_not_reported() {
        let h = harness();
        h.claims.seed(claim(None));
        h.exports.seed(export());

        run(&h).await.unwrap();

        assert!(member_conflict(&h).is_none());
        assert_eq!(h.claims.write_count() + h.exports.write_count(), 0);
        let stored = h.claims.peek(&claim_key()).unwrap();
        assert!(annotation(&stored.metadata, ANNOTATION_LAST_OBSERVED_GENERATION).is_none());
    }

    /// Story: The ServiceExport was removed behind the agent's back
    #[tokio::test]
    async fn story_orphaned_claim_is_deleted() {
        let h = harness();
        h.claims.seed(claim(Some(unconflicted_service_export_condition)));

        run(&h).await.unwrap();
        assert!(h.claims.is_empty());
    }

    // ==========================================================================
    // Export latency observation
    // ==========================================================================

    #[tokio::test]
    async fn duration_is_observed_once_per_generation() {
        let h = harness();
        h.claims.seed(claim(Some(unconflicted_service_export_condition)));
        h.exports.seed(export());

        run(&h).await.unwrap();
        let stored = h.claims.peek(&claim_key()).unwrap();
        assert_eq!(
            annotation(&stored.metadata, ANNOTATION_LAST_OBSERVED_GENERATION),
            Some("7")
        );
        let claim_writes = h.claims.write_count();

        run(&h).await.unwrap();
        assert_eq!(h.claims.write_count(), claim_writes);
    }

    /// Story: The claim is rewritten while the Service stays the same
    ///
    /// Refreshing the claim bumps its own generation, but the exported
    /// Service's generation is unchanged so the latency is not observed
    /// again. A new Service generation is observed once.
    #[tokio::test]
    async fn story_claim_rewrite_is_observed_only_for_a_new_service_generation() {
        let h = harness();
        h.claims.seed(claim(Some(unconflicted_service_export_condition)));
        h.exports.seed(export());
        run(&h).await.unwrap();

        let mut refreshed = h.claims.peek(&claim_key()).unwrap();
        let generation = refreshed.metadata.generation;
        refreshed.spec.service_reference.exported_since = Some(Utc::now());
        h.claims.update(&refreshed).await.unwrap();
        assert!(h.claims.peek(&claim_key()).unwrap().metadata.generation > generation);

        let writes = h.claims.write_count();
        run(&h).await.unwrap();
        assert_eq!(h.claims.write_count(), writes);

        let mut changed = h.claims.peek(&claim_key()).unwrap();
        changed.spec.service_reference.generation = 8;
        h.claims.update(&changed).await.unwrap();
        run(&h).await.unwrap();
        let stored = h.claims.peek(&claim_key()).unwrap();
        assert_eq!(
            annotation(&stored.metadata, ANNOTATION_LAST_OBSERVED_GENERATION),
            Some("8")
        );
    }

    #[tokio::test]
    async fn already_matching_member_condition_still_observes() {
        let h = harness();
        let c = claim(Some(unconflicted_service_export_condition));
        let mut e = export();
        let mut reported = c.status.as_ref().unwrap().conditions[0].clone();
        reported.observed_generation = 2;
        e.status = Some(ServiceExportStatus {
            conditions: vec![reported],
        });
        h.claims.seed(c);
        h.exports.seed(e);

        run(&h).await.unwrap();
        assert_eq!(h.exports.write_count(), 0);
        assert_eq!(h.claims.write_count(), 1);
        assert!(h.events.events().is_empty());
    }

    #[tokio::test]
    async fn missing_claim_is_ignored() {
        let h = harness();
        assert_eq!(run(&h).await.unwrap(), Action::await_change());
    }

    #[tokio::test]
    async fn status_conflict_surfaces_for_requeue() {
        let h = harness();
        h.claims.seed(claim(Some(conflicted_service_export_condition)));
        h.exports.seed(export());
        h.exports
            .fail_next(StoreOperation::UpdateStatus, ErrorKind::Conflict);

        assert!(run(&h).await.unwrap_err().is_conflict());
        run(&h).await.unwrap();
        assert_eq!(member_conflict(&h).unwrap().status, ConditionStatus::True);
    }
}
