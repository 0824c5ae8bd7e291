//! Membership controller
//!
//! Drives the member agent through the fleet membership state machine held
//! in the hub's InternalMemberCluster:
//!
//! - `Join`: start every gated sub-controller, report `Joined=True` and
//!   refresh the heartbeat on a jittered period
//! - `Leave`: stop every sub-controller, delete the objects this agent type
//!   owns in the member cluster, and report `Joined=False`
//!
//! Any other state is logged and ignored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use fleet_net_common::condition::set_status_condition;
use fleet_net_common::crd::{
    AgentType, ClusterState, Condition, ConditionStatus, InternalMemberCluster,
    MultiClusterService, ServiceExport, AGENT_JOINED,
};
use fleet_net_common::kube_utils::is_deleting;
use fleet_net_common::metrics::observe_reconcile;
use fleet_net_common::retry::{retry_on_transient, wait_until_deleted};
use fleet_net_common::store::{ListQuery, ObjectKey, ObjectStore, SharedStore};
use fleet_net_common::{Error, ErrorKind, FleetConfig, Result};

/// Controller name used for metrics and logs
pub const CONTROLLER_NAME: &str = "internalmembercluster";

/// Reason of `Joined=True`
pub const REASON_AGENT_JOINED: &str = "AgentJoined";

/// Reason of `Joined=False`
pub const REASON_AGENT_LEFT: &str = "AgentLeft";

/// Total width of the heartbeat jitter window, in percent of the period
const HEARTBEAT_JITTER_PERCENT: u64 = 10;

/// A sub-controller that runs only while the member is in the fleet
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MemberController: Send + Sync {
    /// Start the controller; starting a running controller is a no-op
    async fn join(&self) -> Result<()>;

    /// Stop the controller; stopping a stopped controller is a no-op
    async fn leave(&self) -> Result<()>;
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared context for the membership controller
pub struct MembershipContext {
    /// InternalMemberClusters in this member's hub namespace
    pub member_clusters: SharedStore<InternalMemberCluster>,
    /// Agent this controller reports for
    pub agent_type: AgentType,
    /// Sub-controllers gated on membership, in start order
    pub controllers: Vec<Arc<dyn MemberController>>,
    /// MultiClusterServices in the member cluster
    pub multi_cluster_services: SharedStore<MultiClusterService>,
    /// ServiceExports in the member cluster
    pub service_exports: SharedStore<ServiceExport>,
    /// Runtime configuration
    pub config: Arc<FleetConfig>,
    /// Fires on shutdown
    pub token: CancellationToken,
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile the InternalMemberCluster of this member
#[instrument(
    skip(imc, ctx),
    fields(internal_member_cluster = %ObjectKey::of(imc.as_ref()), agent = %ctx.agent_type)
)]
pub async fn reconcile(imc: Arc<InternalMemberCluster>, ctx: Arc<MembershipContext>) -> Result<Action> {
    let key = ObjectKey::of(imc.as_ref());
    observe_reconcile(CONTROLLER_NAME, reconcile_membership(&key, &ctx)).await
}

async fn reconcile_membership(key: &ObjectKey, ctx: &MembershipContext) -> Result<Action> {
    let imc = match ctx.member_clusters.get(key).await {
        Ok(imc) => imc,
        Err(e) if e.is_not_found() => {
            debug!("InternalMemberCluster is gone");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    match imc.spec.state {
        ClusterState::Join => {
            join_all_controllers(ctx).await?;
            let period = imc.spec.heartbeat_period_seconds;
            update_agent_status(ctx, imc).await?;
            Ok(Action::requeue(heartbeat_requeue(period)))
        }
        ClusterState::Leave => {
            info!("Member is leaving the fleet, cleaning up");
            leave_all_controllers(ctx).await?;
            cleanup(ctx).await?;
            update_agent_status(ctx, imc).await?;
            Ok(Action::await_change())
        }
        ClusterState::Unknown => {
            error!("InternalMemberCluster is in an invalid state");
            Ok(Action::await_change())
        }
    }
}

/// Run every sub-controller's `join` concurrently; the first error in list order wins
async fn join_all_controllers(ctx: &MembershipContext) -> Result<()> {
    join_all(ctx.controllers.iter().map(|c| c.join()))
        .await
        .into_iter()
        .collect()
}

/// Run every sub-controller's `leave` concurrently; the first error in list order wins
async fn leave_all_controllers(ctx: &MembershipContext) -> Result<()> {
    join_all(ctx.controllers.iter().map(|c| c.leave()))
        .await
        .into_iter()
        .collect()
}

/// Heartbeat period with up to 5% jitter either way
pub fn heartbeat_requeue(period_seconds: i32) -> Duration {
    let period_ms = u64::try_from(period_seconds).unwrap_or_default() * 1000;
    let range = period_ms * HEARTBEAT_JITTER_PERCENT / 100;
    if range == 0 {
        return Duration::from_millis(period_ms);
    }
    let offset = rand::thread_rng().gen_range(0..range);
    Duration::from_millis(period_ms - range / 2 + offset)
}

async fn cleanup(ctx: &MembershipContext) -> Result<()> {
    let removed = match ctx.agent_type {
        AgentType::MultiClusterServiceAgent => {
            delete_all(ctx, ctx.multi_cluster_services.as_ref(), "MultiClusterService").await?
        }
        AgentType::ServiceExportImportAgent => {
            delete_all(ctx, ctx.service_exports.as_ref(), "ServiceExport").await?
        }
        AgentType::MemberAgent => 0,
    };
    info!(objects = removed, "Cleanup completed");
    Ok(())
}

/// Delete every object in `store`, then wait until each one is gone
///
/// Objects already being deleted are not deleted again but are still
/// waited for.
async fn delete_all<K>(ctx: &MembershipContext, store: &dyn ObjectStore<K>, kind: &str) -> Result<usize>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let objects = store.list(&ListQuery::all()).await?;
    let keys: Vec<ObjectKey> = objects.iter().map(ObjectKey::of).collect();

    for obj in objects.iter().filter(|o| !is_deleting(*o)) {
        let key = ObjectKey::of(obj);
        let deleted = retry_on_transient(
            &ctx.config.write_retry,
            &ctx.token,
            &format!("delete {kind}"),
            || store.delete(&key),
        )
        .await;
        match deleted {
            Ok(()) => debug!(object = %key, kind, "Deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!(object = %key, kind, error = %e, "Failed to delete");
                return Err(e);
            }
        }
    }

    for key in &keys {
        wait_until_deleted(
            &ctx.config.delete_wait,
            &ctx.token,
            &format!("wait for {kind} {key} deletion"),
            || store.get(key),
        )
        .await
        .inspect_err(|e| error!(object = %key, kind, error = %e, "Object was not deleted in time"))?;
    }
    Ok(keys.len())
}

fn joined_condition(imc: &InternalMemberCluster, joined: bool) -> Condition {
    let (status, reason) = if joined {
        (ConditionStatus::True, REASON_AGENT_JOINED)
    } else {
        (ConditionStatus::False, REASON_AGENT_LEFT)
    };
    Condition::new(
        AGENT_JOINED,
        status,
        reason,
        "",
        imc.metadata.generation.unwrap_or_default(),
    )
}

/// Report this agent's Joined condition; a lost race is left to the next heartbeat
async fn update_agent_status(ctx: &MembershipContext, mut imc: InternalMemberCluster) -> Result<()> {
    let joined = imc.spec.state == ClusterState::Join;
    let condition = joined_condition(&imc, joined);
    let agent = imc
        .status
        .get_or_insert_with(Default::default)
        .agent_status_mut(ctx.agent_type);
    set_status_condition(&mut agent.conditions, condition);
    if joined {
        agent.last_received_heartbeat = Some(Utc::now());
    }

    match ctx.member_clusters.update_status(&imc).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::Conflict => {
            info!(
                internal_member_cluster = %imc.name_any(),
                "InternalMemberCluster changed while updating status, skipping"
            );
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Failed to update InternalMemberCluster status");
            Err(e)
        }
    }
}

/// Error policy: requeue after the configured delay
pub fn error_policy(imc: Arc<InternalMemberCluster>, error: &Error, ctx: Arc<MembershipContext>) -> Action {
    error!(
        ?error,
        internal_member_cluster = %imc.name_any(),
        "Membership reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue)
}

#[cfg(test)]
mod tests {
    use super::*;

    use fleet_net_common::condition::find_condition;
    use fleet_net_common::crd::{
        InternalMemberClusterSpec, MultiClusterServiceSpec, ServiceExportSpec, ServiceImportRef,
    };
    use fleet_net_common::retry::RetryConfig;
    use fleet_net_common::store::{MemoryStore, StoreOperation};

    struct Harness {
        member_clusters: Arc<MemoryStore<InternalMemberCluster>>,
        mcs: Arc<MemoryStore<MultiClusterService>>,
        exports: Arc<MemoryStore<ServiceExport>>,
        config: Arc<FleetConfig>,
    }

    fn harness() -> Harness {
        let fast = RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::delete_confirmation()
        };
        let config = FleetConfig::member("member-1")
            .unwrap()
            .with_retries(fast.clone(), fast);
        Harness {
            member_clusters: Arc::new(MemoryStore::new()),
            mcs: Arc::new(MemoryStore::new()),
            exports: Arc::new(MemoryStore::new()),
            config: Arc::new(config),
        }
    }

    impl Harness {
        fn context(
            &self,
            agent_type: AgentType,
            controllers: Vec<Arc<dyn MemberController>>,
        ) -> Arc<MembershipContext> {
            Arc::new(MembershipContext {
                member_clusters: self.member_clusters.clone(),
                agent_type,
                controllers,
                multi_cluster_services: self.mcs.clone(),
                service_exports: self.exports.clone(),
                config: self.config.clone(),
                token: CancellationToken::new(),
            })
        }

        fn joined(&self, agent: AgentType) -> Option<Condition> {
            self.member_clusters
                .peek(&imc_key())
                .and_then(|imc| imc.status)
                .and_then(|s| {
                    s.agent_status(agent)
                        .and_then(|a| find_condition(&a.conditions, AGENT_JOINED).cloned())
                })
        }
    }

    fn imc(state: ClusterState) -> InternalMemberCluster {
        let mut imc = InternalMemberCluster::new(
            "member-1",
            InternalMemberClusterSpec {
                state,
                heartbeat_period_seconds: 60,
            },
        );
        imc.metadata.namespace = Some("fleet-member-member-1".to_string());
        imc
    }

    fn imc_key() -> ObjectKey {
        ObjectKey::new("fleet-member-member-1", "member-1")
    }

    fn mcs(ns: &str, name: &str) -> MultiClusterService {
        let mut m = MultiClusterService::new(
            name,
            MultiClusterServiceSpec {
                service_import: ServiceImportRef {
                    name: name.to_string(),
                },
            },
        );
        m.metadata.namespace = Some(ns.to_string());
        m
    }

    fn ok_controller(joins: usize, leaves: usize) -> Arc<dyn MemberController> {
        let mut mock = MockMemberController::new();
        mock.expect_join().times(joins).returning(|| Ok(()));
        mock.expect_leave().times(leaves).returning(|| Ok(()));
        Arc::new(mock)
    }

    async fn run(ctx: &Arc<MembershipContext>, state: ClusterState) -> Result<Action> {
        reconcile(Arc::new(imc(state)), ctx.clone()).await
    }

    // ==========================================================================
    // Story Tests: Joining
    // ==========================================================================

    /// Story: The hub asks the member to join
    #[tokio::test]
    async fn story_join_starts_controllers_and_reports_joined() {
        let h = harness();
        h.member_clusters.seed(imc(ClusterState::Join));
        let ctx = h.context(
            AgentType::ServiceExportImportAgent,
            vec![ok_controller(1, 0), ok_controller(1, 0)],
        );

        let action = run(&ctx, ClusterState::Join).await.unwrap();

        assert_ne!(action, Action::await_change());
        let joined = h.joined(AgentType::ServiceExportImportAgent).unwrap();
        assert_eq!(joined.status, ConditionStatus::True);
        assert_eq!(joined.reason, "AgentJoined");
        let status = h.member_clusters.peek(&imc_key()).unwrap().status.unwrap();
        assert!(status
            .agent_status(AgentType::ServiceExportImportAgent)
            .and_then(|a| a.last_received_heartbeat)
            .is_some());
    }

    /// Story: One sub-controller fails to start
    ///
    /// Every controller is still asked to join, the error is returned, and
    /// the Joined condition is not written.
    #[tokio::test]
    async fn story_join_failure_is_surfaced_after_all_controllers_ran() {
        let h = harness();
        h.member_clusters.seed(imc(ClusterState::Join));
        let mut failing = MockMemberController::new();
        failing
            .expect_join()
            .times(1)
            .returning(|| Err(Error::internal("informer cache did not sync")));
        let ctx = h.context(
            AgentType::MemberAgent,
            vec![Arc::new(failing), ok_controller(1, 0)],
        );

        assert!(run(&ctx, ClusterState::Join).await.is_err());
        assert!(h.joined(AgentType::MemberAgent).is_none());
    }

    #[tokio::test]
    async fn status_conflict_is_swallowed() {
        let h = harness();
        h.member_clusters.seed(imc(ClusterState::Join));
        h.member_clusters
            .fail_next(StoreOperation::UpdateStatus, ErrorKind::Conflict);
        let ctx = h.context(AgentType::MemberAgent, vec![]);

        run(&ctx, ClusterState::Join).await.unwrap();
        assert!(h.joined(AgentType::MemberAgent).is_none());
    }

    #[tokio::test]
    async fn other_status_errors_surface() {
        let h = harness();
        h.member_clusters.seed(imc(ClusterState::Join));
        h.member_clusters
            .fail_next(StoreOperation::UpdateStatus, ErrorKind::Forbidden);
        let ctx = h.context(AgentType::MemberAgent, vec![]);

        assert!(run(&ctx, ClusterState::Join).await.is_err());
    }

    // ==========================================================================
    // Story Tests: Leaving
    // ==========================================================================

    /// Story: The member leaves and its MultiClusterServices are cleaned up
    #[tokio::test]
    async fn story_leave_deletes_multi_cluster_services() {
        let h = harness();
        h.member_clusters.seed(imc(ClusterState::Leave));
        h.mcs.seed(mcs("work", "app"));
        h.mcs.seed(mcs("shop", "cart"));
        h.exports
            .seed(ServiceExport::new("untouched", ServiceExportSpec {}));
        let ctx = h.context(AgentType::MultiClusterServiceAgent, vec![ok_controller(0, 1)]);

        run(&ctx, ClusterState::Leave).await.unwrap();

        assert!(h.mcs.is_empty());
        assert_eq!(h.exports.len(), 1);
        let joined = h.joined(AgentType::MultiClusterServiceAgent).unwrap();
        assert_eq!(joined.status, ConditionStatus::False);
        assert_eq!(joined.reason, "AgentLeft");
    }

    #[tokio::test]
    async fn leave_keeps_the_last_heartbeat() {
        let h = harness();
        h.member_clusters.seed(imc(ClusterState::Join));
        let ctx = h.context(AgentType::MemberAgent, vec![]);
        run(&ctx, ClusterState::Join).await.unwrap();
        let heartbeat = |h: &Harness| {
            h.member_clusters
                .peek(&imc_key())
                .and_then(|i| i.status)
                .and_then(|s| s.agent_status(AgentType::MemberAgent).cloned())
                .and_then(|a| a.last_received_heartbeat)
        };
        let before = heartbeat(&h);

        let mut leaving = h.member_clusters.peek(&imc_key()).unwrap();
        leaving.spec.state = ClusterState::Leave;
        h.member_clusters.seed(leaving);
        run(&ctx, ClusterState::Leave).await.unwrap();

        assert!(before.is_some());
        assert_eq!(heartbeat(&h), before);
    }

    /// Story: A ServiceExport held by a finalizer never goes away
    #[tokio::test]
    async fn story_leave_fails_when_deletion_never_completes() {
        let h = harness();
        h.member_clusters.seed(imc(ClusterState::Leave));
        let mut stuck = ServiceExport::new("app", ServiceExportSpec {});
        stuck.metadata.namespace = Some("work".to_string());
        stuck.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
        h.exports.seed(stuck);
        let ctx = h.context(AgentType::ServiceExportImportAgent, vec![]);

        let err = run(&ctx, ClusterState::Leave).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(h.joined(AgentType::ServiceExportImportAgent).is_none());
    }

    #[tokio::test]
    async fn not_found_delete_still_waits_for_the_object() {
        let h = harness();
        h.member_clusters.seed(imc(ClusterState::Leave));
        h.mcs.seed(mcs("work", "app"));
        h.mcs.fail_next(StoreOperation::Delete, ErrorKind::NotFound);
        let ctx = h.context(AgentType::MultiClusterServiceAgent, vec![]);

        // NotFound is accepted, but the object is still there so the wait runs out.
        let err = run(&ctx, ClusterState::Leave).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn unknown_state_is_ignored() {
        let h = harness();
        h.member_clusters.seed(imc(ClusterState::Unknown));
        let ctx = h.context(AgentType::MemberAgent, vec![ok_controller(0, 0)]);

        let action = run(&ctx, ClusterState::Unknown).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(h.member_clusters.write_count(), 0);
    }

    #[tokio::test]
    async fn missing_member_cluster_is_ignored() {
        let h = harness();
        let ctx = h.context(AgentType::MemberAgent, vec![ok_controller(0, 0)]);
        assert_eq!(
            run(&ctx, ClusterState::Join).await.unwrap(),
            Action::await_change()
        );
    }

    #[test]
    fn heartbeat_jitter_stays_within_five_percent() {
        for _ in 0..100 {
            let d = heartbeat_requeue(20);
            assert!(d >= Duration::from_millis(19_000));
            assert!(d < Duration::from_millis(21_000));
        }
        assert_eq!(heartbeat_requeue(0), Duration::ZERO);
    }
}
