//! ServiceImport resolver
//!
//! Decides, once per claim set, which member cluster's Service spec a
//! ServiceImport exposes. The first resolvable claim the store lists is
//! canonical; every claim whose ports equal the canonical ports contributes
//! its cluster, every other claim is marked conflicted.
//!
//! Resolution only runs while `status.clusters` is empty. After that the
//! claim controller in [`crate::internalserviceexport`] keeps the cluster
//! list current, and resets the status when the last cluster leaves so that
//! the resolver runs again.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use fleet_net_common::condition::{
    conflicted_service_export_condition, unconflicted_service_export_condition,
};
use fleet_net_common::crd::{
    ClusterStatus, Condition, InternalServiceExport, ServiceImport, ServiceImportStatus,
    ServiceImportType,
};
use fleet_net_common::kube_utils::{has_finalizer, is_deleting};
use fleet_net_common::metrics::observe_reconcile;
use fleet_net_common::retry::retry_on_transient;
use fleet_net_common::store::{ListQuery, ObjectKey, SharedStore, CLAIM_NAMESPACED_NAME_INDEX};
use fleet_net_common::{Error, FleetConfig, Result, INTERNAL_SERVICE_EXPORT_FINALIZER};

/// Controller name used for metrics and logs
pub const CONTROLLER_NAME: &str = "serviceimport-resolver";

/// Requeue delay when every agreeing claim vanished mid-resolution
const RESOLVE_AGAIN_AFTER: Duration = Duration::from_millis(100);

// =============================================================================
// Controller context
// =============================================================================

/// Shared context for the ServiceImport resolver
pub struct ServiceImportContext {
    /// ServiceImports in the hub cluster
    pub imports: SharedStore<ServiceImport>,
    /// Claims in the hub cluster; must have the namespaced-name index registered
    pub claims: SharedStore<InternalServiceExport>,
    /// Runtime configuration
    pub config: Arc<FleetConfig>,
    /// Fires on shutdown
    pub token: CancellationToken,
}

/// Claims of one ServiceImport split by agreement with the canonical ports
#[derive(Debug, Default)]
struct Partition {
    no_conflict: Vec<InternalServiceExport>,
    conflict: Vec<InternalServiceExport>,
}

impl Partition {
    /// Split resolvable claims in listing order; the first one is canonical
    fn of(claims: Vec<InternalServiceExport>) -> Self {
        let Some(canonical) = claims.first().map(|c| c.spec.ports.clone()) else {
            return Self::default();
        };
        let (no_conflict, conflict) = claims
            .into_iter()
            .partition(|c| c.spec.ports == canonical);
        Self {
            no_conflict,
            conflict,
        }
    }
}

/// A claim takes part in resolution once the claim controller has added its
/// finalizer, and until it starts deleting
fn is_resolvable(claim: &InternalServiceExport) -> bool {
    !is_deleting(claim) && has_finalizer(claim, INTERNAL_SERVICE_EXPORT_FINALIZER)
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a ServiceImport
#[instrument(skip(import, ctx), fields(service_import = %ObjectKey::of(import.as_ref())))]
pub async fn reconcile(import: Arc<ServiceImport>, ctx: Arc<ServiceImportContext>) -> Result<Action> {
    let key = ObjectKey::of(import.as_ref());
    observe_reconcile(CONTROLLER_NAME, resolve(&key, &ctx)).await
}

async fn resolve(key: &ObjectKey, ctx: &ServiceImportContext) -> Result<Action> {
    let import = match ctx.imports.get(key).await {
        Ok(import) => import,
        Err(e) if e.is_not_found() => {
            debug!("ServiceImport is gone");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    if !import.clusters().is_empty() {
        debug!("ServiceImport is already resolved");
        return Ok(Action::await_change());
    }

    let query = ListQuery::all().matching_field(CLAIM_NAMESPACED_NAME_INDEX, key.to_string());
    let claims = ctx.claims.list(&query).await?;
    let resolvable: Vec<_> = claims.into_iter().filter(is_resolvable).collect();
    let Some(canonical_ports) = resolvable.first().map(|c| c.spec.ports.clone()) else {
        info!("No resolvable claims left, deleting ServiceImport");
        return delete_import(ctx, key).await;
    };

    let partition = Partition::of(resolvable);
    debug!(
        no_conflict = partition.no_conflict.len(),
        conflict = partition.conflict.len(),
        "Partitioned claims"
    );

    let mut clusters = Vec::with_capacity(partition.no_conflict.len());
    for claim in &partition.no_conflict {
        let desired = unconflicted_service_export_condition(claim);
        if mark_claim(ctx, claim, desired).await? {
            clusters.push(ClusterStatus::new(
                claim.spec.service_reference.cluster_id.clone(),
            ));
        }
    }
    if clusters.is_empty() {
        info!("Every agreeing claim disappeared, resolving again");
        return Ok(Action::requeue(RESOLVE_AGAIN_AFTER));
    }

    for claim in &partition.conflict {
        let desired = conflicted_service_export_condition(claim);
        mark_claim(ctx, claim, desired).await?;
    }

    let mut resolved = import;
    resolved.status = Some(ServiceImportStatus {
        ports: canonical_ports,
        clusters,
        type_: Some(ServiceImportType::ClusterSetIP),
        ..Default::default()
    });
    info!(clusters = ?resolved.clusters(), "Resolved ServiceImport");
    retry_on_transient(
        &ctx.config.write_retry,
        &ctx.token,
        "update ServiceImport status",
        || ctx.imports.update_status(&resolved),
    )
    .await
    .inspect_err(|e| error!(error = %e, "Failed to update ServiceImport status"))?;

    Ok(Action::await_change())
}

async fn mark_claim(
    ctx: &ServiceImportContext,
    claim: &InternalServiceExport,
    desired: Condition,
) -> Result<bool> {
    crate::claim::mark_claim(
        ctx.claims.as_ref(),
        &ctx.config.write_retry,
        &ctx.token,
        claim,
        desired,
    )
    .await
}

async fn delete_import(ctx: &ServiceImportContext, key: &ObjectKey) -> Result<Action> {
    match ctx.imports.delete(key).await {
        Ok(()) => Ok(Action::await_change()),
        Err(e) if e.is_not_found() => Ok(Action::await_change()),
        Err(e) => Err(e),
    }
}

/// Error policy: requeue after the configured delay
pub fn error_policy(
    import: Arc<ServiceImport>,
    error: &Error,
    ctx: Arc<ServiceImportContext>,
) -> Action {
    error!(
        ?error,
        service_import = %import.name_any(),
        "ServiceImport reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_net_common::condition::find_condition;
    use fleet_net_common::crd::{
        ConditionStatus, ExportedObjectReference, SERVICE_EXPORT_CONFLICT, InternalServiceExportSpec,
        InternalServiceExportStatus, ServicePort, ServiceImportSpec,
    };
    use fleet_net_common::retry::RetryConfig;
    use fleet_net_common::store::{claim_indexes, MemoryStore, ObjectStore, StoreOperation};
    use fleet_net_common::ErrorKind;

    struct Harness {
        imports: Arc<MemoryStore<ServiceImport>>,
        claims: Arc<MemoryStore<InternalServiceExport>>,
        ctx: Arc<ServiceImportContext>,
    }

    fn harness() -> Harness {
        let imports = Arc::new(MemoryStore::new());
        let claims = Arc::new(MemoryStore::with_indexes(claim_indexes()));
        let fast = RetryConfig {
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::transient_write()
        };
        let ctx = Arc::new(ServiceImportContext {
            imports: imports.clone(),
            claims: claims.clone(),
            config: Arc::new(FleetConfig::hub().with_retries(fast.clone(), fast)),
            token: CancellationToken::new(),
        });
        Harness {
            imports,
            claims,
            ctx,
        }
    }

    fn port(port: i32) -> ServicePort {
        ServicePort {
            name: format!("port-{port}"),
            protocol: "TCP".to_string(),
            port,
            ..Default::default()
        }
    }

    fn claim(cluster: &str, ports: Vec<ServicePort>) -> InternalServiceExport {
        let mut c = InternalServiceExport::new(
            "work-app",
            InternalServiceExportSpec {
                ports,
                service_reference: ExportedObjectReference {
                    cluster_id: cluster.to_string(),
                    kind: "Service".to_string(),
                    namespace: "work".to_string(),
                    name: "app".to_string(),
                    namespaced_name: "work/app".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        c.metadata.namespace = Some(format!("fleet-member-{cluster}"));
        c.metadata.finalizers = Some(vec![INTERNAL_SERVICE_EXPORT_FINALIZER.to_string()]);
        c
    }

    fn import() -> ServiceImport {
        let mut si = ServiceImport::new("app", ServiceImportSpec {});
        si.metadata.namespace = Some("work".to_string());
        si
    }

    fn key() -> ObjectKey {
        ObjectKey::new("work", "app")
    }

    fn conflict_of(h: &Harness, cluster: &str) -> Option<Condition> {
        h.claims
            .peek(&ObjectKey::new(format!("fleet-member-{cluster}"), "work-app"))
            .and_then(|c| c.status)
            .and_then(|s| find_condition(&s.conditions, SERVICE_EXPORT_CONFLICT).cloned())
    }

    async fn run(h: &Harness) -> Result<Action> {
        reconcile(Arc::new(import()), h.ctx.clone()).await
    }

    // ==========================================================================
    // Story Tests: Resolving a claim set
    // ==========================================================================

    /// Story: Two clusters export the same Service with the same ports
    #[tokio::test]
    async fn story_identical_claims_both_contribute() {
        let h = harness();
        h.imports.seed(import());
        h.claims.seed(claim("a", vec![port(8080)]));
        h.claims.seed(claim("b", vec![port(8080)]));

        run(&h).await.unwrap();

        let si = h.imports.peek(&key()).unwrap();
        assert_eq!(
            si.clusters(),
            &[ClusterStatus::new("a"), ClusterStatus::new("b")]
        );
        assert_eq!(si.ports(), &[port(8080)]);
        for cluster in ["a", "b"] {
            let cond = conflict_of(&h, cluster).unwrap();
            assert_eq!(cond.status, ConditionStatus::False);
            assert_eq!(cond.reason, "NoConflictFound");
        }
    }

    /// Story: The first listed claim wins a port disagreement
    #[tokio::test]
    async fn story_first_claim_is_canonical() {
        let h = harness();
        h.imports.seed(import());
        h.claims.seed(claim("a", vec![port(8080), port(9090)]));
        h.claims.seed(claim("b", vec![port(8080)]));

        run(&h).await.unwrap();

        let si = h.imports.peek(&key()).unwrap();
        assert_eq!(si.ports(), &[port(8080), port(9090)]);
        assert_eq!(si.clusters(), &[ClusterStatus::new("a")]);
        assert_eq!(
            si.status.as_ref().and_then(|s| s.type_),
            Some(ServiceImportType::ClusterSetIP)
        );
        assert_eq!(conflict_of(&h, "a").unwrap().status, ConditionStatus::False);
        let b = conflict_of(&h, "b").unwrap();
        assert_eq!(b.status, ConditionStatus::True);
        assert_eq!(b.reason, "ConflictFound");
    }

    /// Story: The last claim is on its way out
    #[tokio::test]
    async fn story_only_deleting_claims_delete_the_import() {
        let h = harness();
        h.imports.seed(import());
        let mut deleting = claim("a", vec![port(8080)]);
        deleting.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        h.claims.seed(deleting);

        run(&h).await.unwrap();
        assert!(h.imports.peek(&key()).is_none());
    }

    /// Story: Re-running on a resolved import writes nothing
    #[tokio::test]
    async fn story_resolution_is_idempotent() {
        let h = harness();
        h.imports.seed(import());
        h.claims.seed(claim("a", vec![port(8080)]));
        h.claims.seed(claim("b", vec![port(9090)]));

        run(&h).await.unwrap();
        let writes = h.imports.write_count() + h.claims.write_count();
        run(&h).await.unwrap();
        assert_eq!(h.imports.write_count() + h.claims.write_count(), writes);
    }

    // ==========================================================================
    // Edge cases
    // ==========================================================================

    #[tokio::test]
    async fn missing_import_is_ignored() {
        let h = harness();
        assert_eq!(run(&h).await.unwrap(), Action::await_change());
    }

    #[tokio::test]
    async fn no_claims_deletes_import() {
        let h = harness();
        h.imports.seed(import());
        run(&h).await.unwrap();
        assert!(h.imports.is_empty());
    }

    #[tokio::test]
    async fn claims_without_finalizer_are_not_resolvable() {
        let h = harness();
        h.imports.seed(import());
        let mut fresh = claim("a", vec![port(8080)]);
        fresh.metadata.finalizers = None;
        h.claims.seed(fresh);

        run(&h).await.unwrap();
        assert!(h.imports.is_empty());
        assert!(conflict_of(&h, "a").is_none());
    }

    #[tokio::test]
    async fn deleting_claims_are_excluded_from_both_buckets() {
        let h = harness();
        h.imports.seed(import());
        let mut deleting = claim("a", vec![port(1)]);
        deleting.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        h.claims.seed(deleting);
        h.claims.seed(claim("b", vec![port(8080)]));

        run(&h).await.unwrap();

        let si = h.imports.peek(&key()).unwrap();
        assert_eq!(si.ports(), &[port(8080)]);
        assert_eq!(si.clusters(), &[ClusterStatus::new("b")]);
        assert!(conflict_of(&h, "a").is_none());
    }

    #[tokio::test]
    async fn equal_conditions_are_not_rewritten() {
        let h = harness();
        h.imports.seed(import());
        let mut c = claim("a", vec![port(8080)]);
        c.metadata.generation = Some(1);
        c.status = Some(InternalServiceExportStatus {
            conditions: vec![unconflicted_service_export_condition(&c)],
        });
        h.claims.seed(c);

        run(&h).await.unwrap();
        assert_eq!(h.claims.write_count(), 0);
        assert_eq!(h.imports.write_count(), 1);
    }

    /// Story: A throttled status write is retried locally
    #[tokio::test]
    async fn story_transient_errors_are_retried() {
        let h = harness();
        h.imports.seed(import());
        h.claims.seed(claim("a", vec![port(8080)]));
        h.claims
            .fail_next(StoreOperation::UpdateStatus, ErrorKind::TooManyRequests);
        h.imports
            .fail_next(StoreOperation::UpdateStatus, ErrorKind::ServerTimeout);

        run(&h).await.unwrap();
        assert_eq!(
            h.imports.peek(&key()).unwrap().clusters(),
            &[ClusterStatus::new("a")]
        );
    }

    #[tokio::test]
    async fn vanished_agreeing_claims_requeue() {
        let h = harness();
        h.imports.seed(import());
        h.claims.seed(claim("a", vec![port(8080)]));
        h.claims
            .fail_next(StoreOperation::UpdateStatus, ErrorKind::NotFound);

        let action = run(&h).await.unwrap();
        assert_eq!(action, Action::requeue(RESOLVE_AGAIN_AFTER));
        assert!(h.imports.peek(&key()).unwrap().clusters().is_empty());
    }

    #[tokio::test]
    async fn vanished_conflicting_claim_does_not_stop_resolution() {
        let h = harness();
        h.imports.seed(import());
        let mut a = claim("a", vec![port(8080)]);
        a.metadata.generation = Some(1);
        a.status = Some(InternalServiceExportStatus {
            conditions: vec![unconflicted_service_export_condition(&a)],
        });
        h.claims.seed(a);
        h.claims.seed(claim("b", vec![port(1)]));
        h.claims.seed(claim("c", vec![port(2)]));
        // a is already marked, so the first status write is b's
        h.claims
            .fail_next(StoreOperation::UpdateStatus, ErrorKind::NotFound);

        run(&h).await.unwrap();
        assert!(conflict_of(&h, "b").is_none());
        assert_eq!(conflict_of(&h, "c").unwrap().status, ConditionStatus::True);
        assert_eq!(
            h.imports.peek(&key()).unwrap().clusters(),
            &[ClusterStatus::new("a")]
        );
    }

    /// Story: A concurrent writer wins the race on a claim
    ///
    /// The Conflict is not retried with the stale object; the controller
    /// requeues and the next run reads fresh state.
    #[tokio::test]
    async fn story_conflict_surfaces_to_the_controller() {
        let h = harness();
        h.imports.seed(import());
        h.claims.seed(claim("a", vec![port(8080)]));
        h.claims
            .fail_next(StoreOperation::UpdateStatus, ErrorKind::Conflict);

        assert!(run(&h).await.unwrap_err().is_conflict());
        run(&h).await.unwrap();
        assert_eq!(
            h.imports.peek(&key()).unwrap().clusters(),
            &[ClusterStatus::new("a")]
        );
    }

    #[tokio::test]
    async fn listing_order_decides_the_winner() {
        let h = harness();
        h.claims.create(&claim("z", vec![port(1)])).await.unwrap();
        h.claims.seed(claim("m", vec![port(2)]));
        h.imports.seed(import());

        run(&h).await.unwrap();
        assert_eq!(h.imports.peek(&key()).unwrap().ports(), &[port(2)]);
    }
}
