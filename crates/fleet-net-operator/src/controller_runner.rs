//! Controller runner - builds controller futures for the hub and member agents
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. The stores, event publishers and contexts are wired here so
//! the reconcilers only ever see the store and API seams.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;

use fleet_net_common::crd::{
    AgentType, InternalMemberCluster, InternalServiceExport, MultiClusterService, ServiceExport,
    ServiceImport, TrafficManagerBackend, TrafficManagerProfile,
};
use fleet_net_common::events::KubeEventPublisher;
use fleet_net_common::store::{claim_indexes, IndexCache, KubeStore, ObjectStore, SharedStore};
use fleet_net_common::FleetConfig;
use fleet_net_hub::{
    internalserviceexport as hub_claims, serviceimport, InternalServiceExportContext,
    ServiceImportContext,
};
use fleet_net_member::{
    internalmembercluster, internalserviceexport as reporter, serviceexport, ControllerFactory,
    GatedController, MemberController, MembershipContext, ReporterContext, ServiceExportContext,
};
use fleet_net_trafficmanager::{backend, profile, BackendContext, ProfileContext, TrafficManagerApi};

/// Watch timeout in seconds; must stay below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller running until shutdown
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn kube_store<K>(client: &Client) -> SharedStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    KubeStore<K>: ObjectStore<K>,
{
    Arc::new(KubeStore::new(client.clone()))
}

/// Hub claim store answering the namespaced-name index from a watch-fed cache
///
/// The returned future feeds the cache and ends when `token` fires.
fn indexed_claim_store(
    client: &Client,
    token: &CancellationToken,
) -> (SharedStore<InternalServiceExport>, ControllerFuture) {
    let (cache, feed) = IndexCache::watch(
        Api::<InternalServiceExport>::all(client.clone()),
        watcher_config(),
        claim_indexes(),
    );
    let store = Arc::new(KubeStore::with_index_cache(client.clone(), cache));
    (store, until_cancelled(token.clone(), feed))
}

/// Build the hub controllers (ServiceImport resolver, hub InternalServiceExport)
pub fn build_hub_controllers(
    client: Client,
    config: Arc<FleetConfig>,
    token: CancellationToken,
) -> Vec<ControllerFuture> {
    let imports: SharedStore<ServiceImport> = kube_store(&client);
    let (claims, claim_index) = indexed_claim_store(&client, &token);

    let import_ctx = Arc::new(ServiceImportContext {
        imports: imports.clone(),
        claims: claims.clone(),
        config: config.clone(),
        token: token.clone(),
    });
    let resolver = Controller::new(Api::<ServiceImport>::all(client.clone()), watcher_config())
        .watches(
            Api::<InternalServiceExport>::all(client.clone()),
            watcher_config(),
            |claim| {
                let reference = &claim.spec.service_reference;
                Some(ObjectRef::<ServiceImport>::new(&reference.name).within(&reference.namespace))
            },
        )
        .shutdown_on_signal()
        .run(serviceimport::reconcile, serviceimport::error_policy, import_ctx)
        .for_each(log_reconcile_result("ServiceImport"));

    let claim_ctx = Arc::new(InternalServiceExportContext {
        claims,
        imports,
        config,
        token,
    });
    let claim_ctrl = Controller::new(Api::<InternalServiceExport>::all(client), watcher_config())
        .shutdown_on_signal()
        .run(hub_claims::reconcile, hub_claims::error_policy, claim_ctx)
        .for_each(log_reconcile_result("InternalServiceExport"));

    tracing::info!("- ServiceImport controller");
    tracing::info!("- InternalServiceExport controller");

    vec![claim_index, Box::pin(resolver), Box::pin(claim_ctrl)]
}

/// Build the Traffic Manager controllers (TrafficManagerProfile, TrafficManagerBackend)
pub fn build_traffic_manager_controllers(
    client: Client,
    config: Arc<FleetConfig>,
    api: Arc<dyn TrafficManagerApi>,
    token: CancellationToken,
) -> Vec<ControllerFuture> {
    let profiles: SharedStore<TrafficManagerProfile> = kube_store(&client);
    let (claims, claim_index) = indexed_claim_store(&client, &token);

    let profile_ctx = Arc::new(ProfileContext {
        profiles: profiles.clone(),
        api: api.clone(),
        config: config.clone(),
        token: token.clone(),
    });
    let profile_ctrl = Controller::new(Api::<TrafficManagerProfile>::all(client.clone()), watcher_config())
        .shutdown_on_signal()
        .run(profile::reconcile, profile::error_policy, profile_ctx)
        .for_each(log_reconcile_result("TrafficManagerProfile"));

    let backend_ctx = Arc::new(BackendContext {
        backends: kube_store(&client),
        profiles,
        imports: kube_store(&client),
        claims,
        api,
        config,
        token,
    });

    let backend_ctrl = Controller::new(Api::<TrafficManagerBackend>::all(client.clone()), watcher_config());
    let by_profile = backend_ctrl.store();
    let by_import = by_profile.clone();
    let by_claim = by_profile.clone();
    let backend_ctrl = backend_ctrl
        .watches(
            Api::<TrafficManagerProfile>::all(client.clone()),
            watcher_config(),
            move |profile| {
                let namespace = profile.namespace();
                let name = profile.name_any();
                backends_matching(&by_profile, |b| {
                    b.namespace() == namespace && b.spec.profile.name == name
                })
            },
        )
        .watches(
            Api::<ServiceImport>::all(client.clone()),
            watcher_config(),
            move |import| {
                let namespace = import.namespace();
                let name = import.name_any();
                backends_matching(&by_import, |b| {
                    b.namespace() == namespace && b.spec.backend.name == name
                })
            },
        )
        .watches(
            Api::<InternalServiceExport>::all(client),
            watcher_config(),
            move |claim| {
                let reference = claim.spec.service_reference;
                backends_matching(&by_claim, |b| {
                    b.namespace().as_deref() == Some(reference.namespace.as_str())
                        && b.spec.backend.name == reference.name
                })
            },
        )
        .shutdown_on_signal()
        .run(backend::reconcile, backend::error_policy, backend_ctx)
        .for_each(log_reconcile_result("TrafficManagerBackend"));

    tracing::info!("- TrafficManagerProfile controller");
    tracing::info!("- TrafficManagerBackend controller");

    vec![claim_index, Box::pin(profile_ctrl), Box::pin(backend_ctrl)]
}

fn backends_matching(
    backends: &Store<TrafficManagerBackend>,
    matches: impl Fn(&TrafficManagerBackend) -> bool,
) -> Vec<ObjectRef<TrafficManagerBackend>> {
    backends
        .state()
        .iter()
        .filter(|b| matches(b))
        .map(|b| ObjectRef::from_obj(b.as_ref()))
        .collect()
}

/// Build the member agent
///
/// The InternalMemberCluster controller always runs. For the ServiceExportImport
/// agent so does the ServiceExport controller: Leave deletes every
/// ServiceExport and only that controller withdraws the claim and releases the
/// cleanup finalizer. The conflict reporter is gated on membership and
/// started by Join.
pub fn build_member_controllers(
    member: Client,
    hub: Client,
    agent_type: AgentType,
    config: Arc<FleetConfig>,
    token: CancellationToken,
) -> Vec<ControllerFuture> {
    let service_exports: SharedStore<ServiceExport> = kube_store(&member);
    let hub_claims: SharedStore<InternalServiceExport> = kube_store(&hub);
    let mut running: Vec<ControllerFuture> = Vec::new();

    let controllers: Vec<Arc<dyn MemberController>> = match agent_type {
        AgentType::ServiceExportImportAgent => {
            let exporter = Arc::new(ServiceExportContext {
                exports: service_exports.clone(),
                services: kube_store(&member),
                claims: hub_claims.clone(),
                events: Arc::new(KubeEventPublisher::new(member.clone(), serviceexport::CONTROLLER_NAME)),
                config: config.clone(),
                token: token.clone(),
            });
            let reporter = Arc::new(ReporterContext {
                claims: hub_claims,
                exports: service_exports.clone(),
                events: Arc::new(KubeEventPublisher::new(member.clone(), reporter::CONTROLLER_NAME)),
                config: config.clone(),
                token: token.clone(),
            });
            tracing::info!("- ServiceExport controller");
            tracing::info!("- InternalServiceExport reporter (gated)");
            running.push(until_cancelled(
                token.clone(),
                service_export_controller(member.clone(), exporter),
            ));
            vec![Arc::new(GatedController::new(
                reporter::CONTROLLER_NAME,
                token.clone(),
                reporter_factory(hub.clone(), config.hub_namespace.clone(), reporter),
            )) as Arc<dyn MemberController>]
        }
        AgentType::MultiClusterServiceAgent | AgentType::MemberAgent => Vec::new(),
    };

    let membership_ctx = Arc::new(MembershipContext {
        member_clusters: kube_store(&hub),
        agent_type,
        controllers,
        multi_cluster_services: kube_store::<MultiClusterService>(&member),
        service_exports,
        config: config.clone(),
        token,
    });
    let membership = Controller::new(
        Api::<InternalMemberCluster>::namespaced(hub, &config.hub_namespace),
        watcher_config(),
    )
    .shutdown_on_signal()
    .run(
        internalmembercluster::reconcile,
        internalmembercluster::error_policy,
        membership_ctx,
    )
    .for_each(log_reconcile_result("InternalMemberCluster"));

    tracing::info!(agent_type = %agent_type, "- InternalMemberCluster controller");

    running.push(Box::pin(membership));
    running
}

fn service_export_controller(
    member: Client,
    ctx: Arc<ServiceExportContext>,
) -> impl Future<Output = ()> + Send + 'static {
    Controller::new(Api::<ServiceExport>::all(member.clone()), watcher_config())
        .watches(Api::<Service>::all(member), watcher_config(), |service| {
            let namespace = service.namespace()?;
            Some(ObjectRef::<ServiceExport>::new(&service.name_any()).within(&namespace))
        })
        .shutdown_on_signal()
        .run(serviceexport::reconcile, serviceexport::error_policy, ctx)
        .for_each(log_reconcile_result("ServiceExport"))
}

fn reporter_factory(hub: Client, hub_namespace: String, ctx: Arc<ReporterContext>) -> ControllerFactory {
    Arc::new(move |stop: CancellationToken| {
        let controller = Controller::new(
            Api::<InternalServiceExport>::namespaced(hub.clone(), &hub_namespace),
            watcher_config(),
        )
        .run(reporter::reconcile, reporter::error_policy, ctx.clone())
        .for_each(log_reconcile_result("InternalServiceExport reporter"));
        until_cancelled(stop, controller)
    })
}

/// Drive `controller` until `stop` fires; dropping it ends its watches
fn until_cancelled(
    stop: CancellationToken,
    controller: impl Future<Output = ()> + Send + 'static,
) -> BoxFuture<'static, ()> {
    async move {
        tokio::select! {
            () = controller => {}
            () = stop.cancelled() => {}
        }
    }
    .boxed()
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
