//! fleet-net - multi-cluster Service networking for a fleet of Kubernetes clusters

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;

use fleet_net_common::crd::{
    AgentType, EndpointSliceExport, EndpointSliceImport, InternalMemberCluster,
    InternalServiceExport, MultiClusterService, ServiceExport, ServiceImport,
    TrafficManagerBackend, TrafficManagerProfile,
};
use fleet_net_common::telemetry::{init_telemetry, TelemetryConfig};
use fleet_net_common::kube_utils::create_client;
use fleet_net_common::FleetConfig;
use fleet_net_operator::controller_runner::{
    build_hub_controllers, build_member_controllers, build_traffic_manager_controllers,
};
use fleet_net_trafficmanager::arm::DEFAULT_ARM_ENDPOINT;
use fleet_net_trafficmanager::{ArmTrafficManagerClient, MeteredTrafficManagerApi, TrafficManagerApi};

/// fleet-net - exports Services from member clusters and imports them fleet-wide
#[derive(Parser, Debug)]
#[command(name = "fleet-net", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the hub controllers
    ///
    /// Resolves ServiceImports from the claims member clusters export and,
    /// when enabled, programs Azure Traffic Manager.
    Hub(HubArgs),

    /// Run the agent of one member cluster
    ///
    /// Connects to the member cluster through the in-cluster config and to
    /// the hub through `--hub-kubeconfig`.
    Member(MemberArgs),
}

#[derive(Args, Debug)]
struct HubArgs {
    /// Seconds to wait for a new ServiceImport to be resolved before re-checking a claim
    #[arg(long, env = "FLEET_SERVICE_IMPORT_PROCESS_SECONDS")]
    service_import_process_seconds: Option<u64>,

    #[command(flatten)]
    traffic_manager: TrafficManagerArgs,
}

#[derive(Args, Debug)]
struct TrafficManagerArgs {
    /// Run the TrafficManagerProfile and TrafficManagerBackend controllers
    #[arg(long, env = "FLEET_ENABLE_TRAFFIC_MANAGER")]
    enable_traffic_manager: bool,

    /// Azure subscription holding the Traffic Manager profiles
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    azure_subscription_id: Option<String>,

    /// Resource group the TrafficManagerBackend controller looks profiles up in
    #[arg(long, env = "FLEET_TRAFFIC_MANAGER_RESOURCE_GROUP")]
    traffic_manager_resource_group: Option<String>,

    /// Azure Resource Manager endpoint
    #[arg(long, env = "AZURE_ARM_ENDPOINT", default_value = DEFAULT_ARM_ENDPOINT)]
    arm_endpoint: String,

    /// File holding a bearer token for Azure Resource Manager, re-read on every call
    #[arg(long, env = "AZURE_TOKEN_FILE")]
    azure_token_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct MemberArgs {
    /// Name of this member cluster in the fleet
    #[arg(long, env = "MEMBER_CLUSTER_NAME")]
    member_cluster_name: String,

    /// Kubeconfig for the hub cluster
    #[arg(long, env = "HUB_KUBECONFIG")]
    hub_kubeconfig: PathBuf,

    /// Agent this process registers as in the InternalMemberCluster status
    #[arg(long, value_enum, default_value_t = AgentKind::ServiceExportImport)]
    agent_type: AgentKind,

    /// Export the Traffic Manager properties of LoadBalancer Services
    #[arg(long, env = "FLEET_ENABLE_TRAFFIC_MANAGER")]
    enable_traffic_manager: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AgentKind {
    /// Exports ServiceExports and reports conflicts back
    ServiceExportImport,
    /// Imports Services through MultiClusterServices
    MultiClusterService,
}

impl From<AgentKind> for AgentType {
    fn from(kind: AgentKind) -> Self {
        match kind {
            AgentKind::ServiceExportImport => AgentType::ServiceExportImportAgent,
            AgentKind::MultiClusterService => AgentType::MultiClusterServiceAgent,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print_crds()?;
        return Ok(());
    }

    match cli.command {
        Some(Commands::Hub(args)) => run_hub(args).await,
        Some(Commands::Member(args)) => run_member(args).await,
        None => anyhow::bail!("a subcommand is required: hub or member"),
    }
}

fn print_crds() -> anyhow::Result<()> {
    let crds = [
        ServiceExport::crd(),
        InternalServiceExport::crd(),
        ServiceImport::crd(),
        MultiClusterService::crd(),
        InternalMemberCluster::crd(),
        EndpointSliceExport::crd(),
        EndpointSliceImport::crd(),
        TrafficManagerProfile::crd(),
        TrafficManagerBackend::crd(),
    ];
    for crd in &crds {
        let yaml = serde_yaml::to_string(crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("---\n{yaml}");
    }
    Ok(())
}

async fn run_hub(args: HubArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::new("fleet-net-hub"))?;

    let tm = &args.traffic_manager;
    let mut config = FleetConfig::hub()
        .with_traffic_manager(tm.enable_traffic_manager)
        .with_traffic_manager_resource_group(
            tm.traffic_manager_resource_group.clone().unwrap_or_default(),
        );
    if let Some(seconds) = args.service_import_process_seconds {
        config = config.with_service_import_process_time(Duration::from_secs(seconds));
    }
    let config = Arc::new(config);

    let client = create_client(None)
        .await
        .context("Failed to create the hub client")?;
    let token = shutdown_token();

    tracing::info!("Starting hub controllers");
    let mut controllers = build_hub_controllers(client.clone(), config.clone(), token.clone());
    if config.traffic_manager_enabled {
        let api = traffic_manager_api(tm)?;
        controllers.extend(build_traffic_manager_controllers(client, config, api, token));
    }

    futures::future::join_all(controllers).await;
    tracing::info!("Hub controllers stopped");
    Ok(())
}

async fn run_member(args: MemberArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        member_cluster: Some(args.member_cluster_name.clone()),
        ..TelemetryConfig::new("fleet-net-member")
    })?;

    let config = Arc::new(
        FleetConfig::member(&args.member_cluster_name)?
            .with_traffic_manager(args.enable_traffic_manager),
    );

    let member = create_client(None)
        .await
        .context("Failed to create the member cluster client")?;
    let hub = create_client(Some(&args.hub_kubeconfig))
        .await
        .with_context(|| format!("Failed to create the hub client from {}", args.hub_kubeconfig.display()))?;
    let token = shutdown_token();

    tracing::info!(
        member_cluster = %config.member_cluster_name,
        hub_namespace = %config.hub_namespace,
        "Starting member agent"
    );
    let controllers =
        build_member_controllers(member, hub, args.agent_type.into(), config, token.clone());

    futures::future::join_all(controllers).await;
    token.cancel();
    tracing::info!("Member agent stopped");
    Ok(())
}

fn traffic_manager_api(args: &TrafficManagerArgs) -> anyhow::Result<Arc<dyn TrafficManagerApi>> {
    let subscription = args
        .azure_subscription_id
        .as_deref()
        .context("--azure-subscription-id is required with --enable-traffic-manager")?;
    let token_file = args
        .azure_token_file
        .as_deref()
        .context("--azure-token-file is required with --enable-traffic-manager")?;
    if args.traffic_manager_resource_group.is_none() {
        anyhow::bail!("--traffic-manager-resource-group is required with --enable-traffic-manager");
    }
    let client = ArmTrafficManagerClient::new(args.arm_endpoint.as_str(), subscription, token_file)?;
    Ok(Arc::new(MeteredTrafficManagerApi::new(client)))
}

/// Token cancelled on Ctrl-C; gated member controllers and retries stop with it
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            on_signal.cancel();
        }
    });
    token
}
