use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use market_framework::bus::NatsBus;
use market_framework::config::{BusArgs, HealthArgs, StoreArgs, SyncArgs, parse_address};
use market_framework::evm::EvmLogClient;
use market_framework::query::{NODES_QUERY_SUBJECT, serve_queries};
use market_framework::repository::Repository;
use market_framework::shutdown::{self, wait_for_signal};
use market_framework::sync::EventSynchronizer;
use market_framework::tasks::ServiceTasks;
use market_framework::telemetry::init_tracing;
use node_registry::SERVICE_NAME;
use node_registry::chain::{RegistryEventKind, ReputationChainSource};
use node_registry::registry::LivenessRegistry;
use node_registry::service::NodesQuery;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tracks GPU provider registrations and liveness", long_about = None)]
struct Args {
    /// Reputation chain RPC URL
    #[arg(long, env = "OPBNB_RPC_URL")]
    reputation_rpc_url: String,

    /// NodeReputation contract address
    #[arg(long, env = "NODE_REPUTATION_CONTRACT_ADDRESS")]
    node_reputation: String,

    /// Seconds between offline sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    sweep_interval_secs: u64,

    /// Seconds without a heartbeat before a provider is marked offline
    #[arg(long, env = "LIVENESS_THRESHOLD_SECS", default_value = "300")]
    liveness_threshold_secs: u64,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    bus: BusArgs,

    #[command(flatten)]
    sync: SyncArgs,

    #[command(flatten)]
    health: HealthArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing()?;

    let args = Args::parse();

    let contract = parse_address(&args.node_reputation, "NodeReputation contract")?;
    let client = EvmLogClient::new(&args.reputation_rpc_url, contract)?;

    let repo = Repository::new(&args.store.database_url)
        .await
        .context("Failed to initialize the Repository from the provided DB URL")?;
    info!("Applying pending migrations");
    repo.apply_migrations().await?;

    let bus = NatsBus::connect(&args.bus.nats_url)
        .await
        .context("Failed to connect to NATS")?;

    let health = args.health.serve(SERVICE_NAME, args.sync.range_size);
    let registry = LivenessRegistry::new(
        repo.clone(),
        Duration::from_secs(args.liveness_threshold_secs),
    );

    let mut synchronizer = EventSynchronizer::new(
        ReputationChainSource::new(client),
        registry.clone(),
        repo,
        vec![RegistryEventKind::NodeRegistered, RegistryEventKind::NodeHeartbeat],
        args.sync.sync_config(SERVICE_NAME),
    )
    .with_health(health.clone());
    synchronizer
        .initialize()
        .await
        .context("Failed to resolve the starting block")?;

    info!(
        rpc = %args.reputation_rpc_url,
        contract = %contract,
        sweep_interval_secs = args.sweep_interval_secs,
        liveness_threshold_secs = args.liveness_threshold_secs,
        "Starting node registry"
    );

    let (trigger, stop) = shutdown::channel();
    let mut tasks = ServiceTasks::new(health.clone());
    tasks.spawn("synchronizer", synchronizer.run(stop.clone()));
    tasks.spawn(
        "sweeper",
        registry.clone().run_sweeper(
            Duration::from_secs(args.sweep_interval_secs),
            health,
            stop.clone(),
        ),
    );
    tasks.spawn(
        "nodes-query",
        serve_queries(
            bus,
            NODES_QUERY_SUBJECT.to_string(),
            NodesQuery(registry),
            stop,
        ),
    );

    tasks.supervise(wait_for_signal(), trigger).await;

    info!("Node registry stopped");
    Ok(())
}
