//! InternalServiceExport controller (hub)
//!
//! Owns the lifecycle of one claim against its ServiceImport. The resolver
//! picks the winning ports once; from then on this controller adds a cluster
//! whose claim agrees, removes it when the claim disagrees or goes away, and
//! resets the status when the last cluster leaves.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use fleet_net_common::condition::{
    conflicted_service_export_condition, unconflicted_service_export_condition,
};
use fleet_net_common::crd::{
    ClusterStatus, InternalServiceExport, ServiceImport, ServiceImportSpec, ServiceImportStatus,
};
use fleet_net_common::kube_utils::{add_finalizer, has_finalizer, is_deleting, remove_finalizer};
use fleet_net_common::metrics::observe_reconcile;
use fleet_net_common::retry::retry_on_transient;
use fleet_net_common::store::{ObjectKey, SharedStore};
use fleet_net_common::{Error, FleetConfig, Result, INTERNAL_SERVICE_EXPORT_FINALIZER};

use crate::claim::mark_claim;

/// Controller name used for metrics and logs
pub const CONTROLLER_NAME: &str = "internalserviceexport-hub";

// =============================================================================
// Controller context
// =============================================================================

/// Shared context for the hub InternalServiceExport controller
pub struct InternalServiceExportContext {
    /// Claims in the hub cluster
    pub claims: SharedStore<InternalServiceExport>,
    /// ServiceImports in the hub cluster
    pub imports: SharedStore<ServiceImport>,
    /// Runtime configuration
    pub config: Arc<FleetConfig>,
    /// Fires on shutdown
    pub token: CancellationToken,
}

impl InternalServiceExportContext {
    async fn write_claim(&self, claim: &InternalServiceExport) -> Result<InternalServiceExport> {
        retry_on_transient(
            &self.config.write_retry,
            &self.token,
            "update InternalServiceExport",
            || self.claims.update(claim),
        )
        .await
    }

    async fn write_import_status(&self, import: &ServiceImport) -> Result<ServiceImport> {
        retry_on_transient(
            &self.config.write_retry,
            &self.token,
            "update ServiceImport status",
            || self.imports.update_status(import),
        )
        .await
    }
}

// =============================================================================
// Status helpers
// =============================================================================

/// Remove `cluster` from the import status; returns whether the status changed
///
/// Removing the last cluster clears the status so the resolver runs again.
fn remove_cluster(import: &mut ServiceImport, cluster: &str) -> bool {
    let Some(status) = import.status.as_mut() else {
        return false;
    };
    let before = status.clusters.len();
    status.clusters.retain(|c| c.cluster != cluster);
    if status.clusters.len() == before {
        return false;
    }
    if status.clusters.is_empty() {
        *status = ServiceImportStatus::default();
    }
    true
}

/// Add `cluster` to the import status; returns false when it was already present
fn add_cluster(import: &mut ServiceImport, cluster: &str) -> bool {
    let status = import.status.get_or_insert_with(Default::default);
    if status.clusters.iter().any(|c| c.cluster == cluster) {
        return false;
    }
    status.clusters.push(ClusterStatus::new(cluster));
    true
}

/// Key of the ServiceImport a claim contributes to
fn import_key(claim: &InternalServiceExport) -> ObjectKey {
    let reference = &claim.spec.service_reference;
    ObjectKey::new(reference.namespace.clone(), reference.name.clone())
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile an InternalServiceExport in the hub
#[instrument(skip(claim, ctx), fields(claim = %ObjectKey::of(claim.as_ref())))]
pub async fn reconcile(
    claim: Arc<InternalServiceExport>,
    ctx: Arc<InternalServiceExportContext>,
) -> Result<Action> {
    let key = ObjectKey::of(claim.as_ref());
    observe_reconcile(CONTROLLER_NAME, reconcile_claim(&key, &ctx)).await
}

async fn reconcile_claim(key: &ObjectKey, ctx: &InternalServiceExportContext) -> Result<Action> {
    let claim = match ctx.claims.get(key).await {
        Ok(claim) => claim,
        Err(e) if e.is_not_found() => {
            debug!("Claim is gone");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    if is_deleting(&claim) {
        if has_finalizer(&claim, INTERNAL_SERVICE_EXPORT_FINALIZER) {
            withdraw(ctx, claim).await?;
        }
        return Ok(Action::await_change());
    }

    let mut claim = claim;
    if add_finalizer(&mut claim, INTERNAL_SERVICE_EXPORT_FINALIZER) {
        debug!("Adding cleanup finalizer");
        claim = ctx.write_claim(&claim).await?;
    }

    let mut import = get_or_create_import(ctx, &claim).await?;
    if import.ports().is_empty() {
        debug!("ServiceImport is not resolved yet");
        return Ok(Action::requeue(ctx.config.service_import_process_time));
    }

    let cluster = claim.spec.service_reference.cluster_id.clone();
    if import.ports() != claim.spec.ports.as_slice() {
        if remove_cluster(&mut import, &cluster) {
            info!(%cluster, "Claim disagrees with the resolved ports, removing cluster");
            import = ctx.write_import_status(&import).await?;
        }
        if import.ports().is_empty() {
            // The import was reset; wait for the resolver to pick again.
            return Ok(Action::requeue(ctx.config.service_import_process_time));
        }
        let desired = conflicted_service_export_condition(&claim);
        mark_claim(
            ctx.claims.as_ref(),
            &ctx.config.write_retry,
            &ctx.token,
            &claim,
            desired,
        )
        .await?;
        return Ok(Action::await_change());
    }

    if add_cluster(&mut import, &cluster) {
        info!(%cluster, "Adding cluster to ServiceImport");
        ctx.write_import_status(&import).await?;
    }
    let desired = unconflicted_service_export_condition(&claim);
    mark_claim(
        ctx.claims.as_ref(),
        &ctx.config.write_retry,
        &ctx.token,
        &claim,
        desired,
    )
    .await?;
    Ok(Action::await_change())
}

/// Remove a deleting claim's cluster from its ServiceImport, then release the claim
async fn withdraw(ctx: &InternalServiceExportContext, mut claim: InternalServiceExport) -> Result<()> {
    let cluster = claim.spec.service_reference.cluster_id.clone();
    match ctx.imports.get(&import_key(&claim)).await {
        Ok(mut import) => {
            if remove_cluster(&mut import, &cluster) {
                info!(%cluster, "Withdrawing cluster from ServiceImport");
                ctx.write_import_status(&import).await?;
            }
        }
        Err(e) if e.is_not_found() => debug!("ServiceImport is gone"),
        Err(e) => return Err(e),
    }

    remove_finalizer(&mut claim, INTERNAL_SERVICE_EXPORT_FINALIZER);
    match ctx.write_claim(&claim).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

async fn get_or_create_import(
    ctx: &InternalServiceExportContext,
    claim: &InternalServiceExport,
) -> Result<ServiceImport> {
    let key = import_key(claim);
    match ctx.imports.get(&key).await {
        Ok(import) => return Ok(import),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    info!(service_import = %key, "Creating ServiceImport");
    let mut import = ServiceImport::new(&key.name, ServiceImportSpec {});
    import.metadata.namespace = Some(key.namespace.clone());
    retry_on_transient(
        &ctx.config.write_retry,
        &ctx.token,
        "create ServiceImport",
        || ctx.imports.create(&import),
    )
    .await
}

/// Error policy: requeue after the configured delay
pub fn error_policy(
    claim: Arc<InternalServiceExport>,
    error: &Error,
    ctx: Arc<InternalServiceExportContext>,
) -> Action {
    error!(
        ?error,
        claim = %claim.name_any(),
        "InternalServiceExport reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use fleet_net_common::condition::find_condition;
    use fleet_net_common::crd::{
        ConditionStatus, ExportedObjectReference, InternalServiceExportSpec, ServicePort,
        ServiceImportType, SERVICE_EXPORT_CONFLICT,
    };
    use fleet_net_common::retry::RetryConfig;
    use fleet_net_common::store::{claim_indexes, MemoryStore, ObjectStore, StoreOperation};
    use fleet_net_common::ErrorKind;

    struct Harness {
        claims: Arc<MemoryStore<InternalServiceExport>>,
        imports: Arc<MemoryStore<ServiceImport>>,
        ctx: Arc<InternalServiceExportContext>,
    }

    fn harness() -> Harness {
        let claims = Arc::new(MemoryStore::with_indexes(claim_indexes()));
        let imports = Arc::new(MemoryStore::new());
        let fast = RetryConfig {
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::transient_write()
        };
        let ctx = Arc::new(InternalServiceExportContext {
            claims: claims.clone(),
            imports: imports.clone(),
            config: Arc::new(
                FleetConfig::hub()
                    .with_service_import_process_time(Duration::from_secs(2))
                    .with_retries(fast.clone(), fast),
            ),
            token: CancellationToken::new(),
        });
        Harness {
            claims,
            imports,
            ctx,
        }
    }

    fn port(port: i32) -> ServicePort {
        ServicePort {
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
        c
    }

    fn claim_key(cluster: &str) -> ObjectKey {
        ObjectKey::new(format!("fleet-member-{cluster}"), "work-app")
    }

    fn import_key() -> ObjectKey {
        ObjectKey::new("work", "app")
    }

    fn resolved_import(ports: Vec<ServicePort>, clusters: &[&str]) -> ServiceImport {
        let mut si = ServiceImport::new("app", ServiceImportSpec {});
        si.metadata.namespace = Some("work".to_string());
        si.status = Some(ServiceImportStatus {
            ports,
            clusters: clusters.iter().map(|c| ClusterStatus::new(*c)).collect(),
            type_: Some(ServiceImportType::ClusterSetIP),
            ..Default::default()
        });
        si
    }

    async fn run(h: &Harness, cluster: &str) -> Result<Action> {
        reconcile(Arc::new(claim(cluster, vec![])), h.ctx.clone()).await
    }

    fn conflict_of(h: &Harness, cluster: &str) -> Option<ConditionStatus> {
        h.claims
            .peek(&claim_key(cluster))
            .and_then(|c| c.status)
            .and_then(|s| find_condition(&s.conditions, SERVICE_EXPORT_CONFLICT).map(|c| c.status))
    }

    // ==========================================================================
    // Story Tests: A new claim
    // ==========================================================================

    /// Story: The first claim for a Service creates its ServiceImport and waits
    #[tokio::test]
    async fn story_first_claim_creates_import_and_waits() {
        let h = harness();
        h.claims.seed(claim("a", vec![port(80)]));

        let action = run(&h, "a").await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(2)));
        let stored = h.claims.peek(&claim_key("a")).unwrap();
        assert!(has_finalizer(&stored, INTERNAL_SERVICE_EXPORT_FINALIZER));
        let si = h.imports.peek(&import_key()).unwrap();
        assert!(si.clusters().is_empty());
        assert!(conflict_of(&h, "a").is_none());
    }

    /// Story: A late agreeing claim joins a resolved import
    #[tokio::test]
    async fn story_agreeing_claim_joins() {
        let h = harness();
        h.imports.seed(resolved_import(vec![port(80)], &["a"]));
        h.claims.seed(claim("b", vec![port(80)]));

        run(&h, "b").await.unwrap();

        let si = h.imports.peek(&import_key()).unwrap();
        assert_eq!(si.clusters(), &[ClusterStatus::new("a"), ClusterStatus::new("b")]);
        assert_eq!(conflict_of(&h, "b"), Some(ConditionStatus::False));
    }

    /// Story: A late disagreeing claim is marked conflicted
    #[tokio::test]
    async fn story_disagreeing_claim_is_conflicted() {
        let h = harness();
        h.imports.seed(resolved_import(vec![port(80)], &["a"]));
        h.claims.seed(claim("b", vec![port(443)]));

        run(&h, "b").await.unwrap();

        let si = h.imports.peek(&import_key()).unwrap();
        assert_eq!(si.clusters(), &[ClusterStatus::new("a")]);
        assert_eq!(conflict_of(&h, "b"), Some(ConditionStatus::True));
    }

    /// Story: The only contributor changes its ports
    ///
    /// Its cluster is removed, the import is reset, and the resolver gets to
    /// choose again.
    #[tokio::test]
    async fn story_sole_contributor_changing_ports_resets_import() {
        let h = harness();
        h.imports.seed(resolved_import(vec![port(80)], &["a"]));
        h.claims.seed(claim("a", vec![port(8080)]));

        let action = run(&h, "a").await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(2)));
        let si = h.imports.peek(&import_key()).unwrap();
        assert_eq!(si.status, Some(ServiceImportStatus::default()));
        assert!(conflict_of(&h, "a").is_none());
    }

    #[tokio::test]
    async fn agreeing_claim_twice_writes_once() {
        let h = harness();
        h.imports.seed(resolved_import(vec![port(80)], &["a"]));
        h.claims.seed(claim("b", vec![port(80)]));

        run(&h, "b").await.unwrap();
        let writes = h.imports.write_count() + h.claims.write_count();
        run(&h, "b").await.unwrap();
        assert_eq!(h.imports.write_count() + h.claims.write_count(), writes);
    }

    // ==========================================================================
    // Story Tests: A claim going away
    // ==========================================================================

    /// Story: A deleting claim withdraws its cluster and is released
    #[tokio::test]
    async fn story_deleting_claim_withdraws() {
        let h = harness();
        h.imports.seed(resolved_import(vec![port(80)], &["a", "b"]));
        let mut c = claim("b", vec![port(80)]);
        c.metadata.finalizers = Some(vec![INTERNAL_SERVICE_EXPORT_FINALIZER.to_string()]);
        h.claims.seed(c);
        h.claims.delete(&claim_key("b")).await.unwrap();

        run(&h, "b").await.unwrap();

        assert!(h.claims.peek(&claim_key("b")).is_none());
        let si = h.imports.peek(&import_key()).unwrap();
        assert_eq!(si.clusters(), &[ClusterStatus::new("a")]);
    }

    #[tokio::test]
    async fn last_deleting_claim_resets_import() {
        let h = harness();
        h.imports.seed(resolved_import(vec![port(80)], &["a"]));
        let mut c = claim("a", vec![port(80)]);
        c.metadata.finalizers = Some(vec![INTERNAL_SERVICE_EXPORT_FINALIZER.to_string()]);
        c.metadata.deletion_timestamp = Some(Time(Utc::now()));
        h.claims.seed(c);

        run(&h, "a").await.unwrap();

        let si = h.imports.peek(&import_key()).unwrap();
        assert_eq!(si.status, Some(ServiceImportStatus::default()));
        assert!(h.claims.is_empty());
    }

    #[tokio::test]
    async fn deleting_claim_without_import_is_released() {
        let h = harness();
        let mut c = claim("a", vec![port(80)]);
        c.metadata.finalizers = Some(vec![INTERNAL_SERVICE_EXPORT_FINALIZER.to_string()]);
        c.metadata.deletion_timestamp = Some(Time(Utc::now()));
        h.claims.seed(c);

        run(&h, "a").await.unwrap();
        assert!(h.claims.is_empty());
        assert!(h.imports.is_empty());
    }

    #[tokio::test]
    async fn missing_claim_is_ignored() {
        let h = harness();
        assert_eq!(run(&h, "a").await.unwrap(), Action::await_change());
    }

    // ==========================================================================
    // Failure handling
    // ==========================================================================

    #[tokio::test]
    async fn finalizer_conflict_surfaces() {
        let h = harness();
        h.claims.seed(claim("a", vec![port(80)]));
        h.claims.fail_next(StoreOperation::Update, ErrorKind::Conflict);

        assert!(run(&h, "a").await.unwrap_err().is_conflict());
        assert!(h.imports.is_empty());
    }

    #[tokio::test]
    async fn throttled_import_write_is_retried() {
        let h = harness();
        h.imports.seed(resolved_import(vec![port(80)], &["a"]));
        h.claims.seed(claim("b", vec![port(80)]));
        h.imports
            .fail_next(StoreOperation::UpdateStatus, ErrorKind::TooManyRequests);

        run(&h, "b").await.unwrap();
        assert_eq!(h.imports.peek(&import_key()).unwrap().clusters().len(), 2);
    }

    #[test]
    fn remove_cluster_reports_changes() {
        let mut si = resolved_import(vec![port(80)], &["a", "b"]);
        assert!(!remove_cluster(&mut si, "c"));
        assert!(remove_cluster(&mut si, "a"));
        assert_eq!(si.ports(), &[port(80)]);
        assert!(remove_cluster(&mut si, "b"));
        assert!(si.ports().is_empty());
        assert!(si.status.as_ref().is_some_and(|s| s.type_.is_none()));
    }

    #[test]
    fn add_cluster_is_idempotent() {
        let mut si = resolved_import(vec![port(80)], &["a"]);
        assert!(add_cluster(&mut si, "b"));
        assert!(!add_cluster(&mut si, "b"));
        assert_eq!(si.clusters().len(), 2);
    }
}
