use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use market_framework::bus::NatsBus;
use market_framework::config::{BusArgs, HealthArgs, StoreArgs, SyncArgs, parse_address};
use market_framework::evm::EvmLogClient;
use market_framework::query::serve_queries;
use market_framework::repository::Repository;
use market_framework::shutdown::{self, wait_for_signal};
use market_framework::sync::EventSynchronizer;
use market_framework::tasks::ServiceTasks;
use market_framework::telemetry::init_tracing;
use reputation_settler::SERVICE_NAME;
use reputation_settler::chain::{ConfirmationEvent, ConfirmationSource};
use reputation_settler::engine::SettlementEngine;
use reputation_settler::ledger::{JobManagerLedger, NodeReputationLedger};
use reputation_settler::service::{REPUTATION_QUERY_SUBJECT, ReputationQuery};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Credits providers on the reputation chain for confirmed jobs", long_about = None)]
struct Args {
    /// Payment chain RPC URL
    #[arg(long, env = "BSC_RPC_URL")]
    payment_rpc_url: String,

    /// Reputation chain RPC URL
    #[arg(long, env = "OPBNB_RPC_URL")]
    reputation_rpc_url: String,

    /// JobManager contract address
    #[arg(long, env = "JOB_MANAGER_CONTRACT_ADDRESS")]
    job_manager: String,

    /// NodeReputation contract address
    #[arg(long, env = "NODE_REPUTATION_CONTRACT_ADDRESS")]
    node_reputation: String,

    /// Key signing incrementJobs transactions
    #[arg(long, env = "ADMIN_WALLET_PRIVATE_KEY", hide_env_values = true)]
    admin_private_key: String,

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

    let job_manager = parse_address(&args.job_manager, "JobManager contract")?;
    let node_reputation = parse_address(&args.node_reputation, "NodeReputation contract")?;

    let payment_client = EvmLogClient::new(&args.payment_rpc_url, job_manager)?;
    let jobs = JobManagerLedger::new(&payment_client);
    let reputation = NodeReputationLedger::new(
        &args.reputation_rpc_url,
        node_reputation,
        &args.admin_private_key,
    )?;

    let repo = Repository::new(&args.store.database_url)
        .await
        .context("Failed to initialize the Repository from the provided DB URL")?;
    info!("Applying pending migrations");
    repo.apply_migrations().await?;

    let bus = NatsBus::connect(&args.bus.nats_url)
        .await
        .context("Failed to connect to NATS")?;

    let health = args.health.serve(SERVICE_NAME, args.sync.range_size);
    let engine = SettlementEngine::new(jobs, reputation, repo.clone());

    let mut synchronizer = EventSynchronizer::new(
        ConfirmationSource::new(payment_client),
        engine.clone(),
        repo,
        vec![ConfirmationEvent::JobConfirmed],
        args.sync.sync_config(SERVICE_NAME),
    )
    .with_health(health.clone());
    synchronizer
        .initialize()
        .await
        .context("Failed to resolve the starting block")?;

    info!(
        payment_rpc = %args.payment_rpc_url,
        reputation_rpc = %args.reputation_rpc_url,
        %job_manager,
        %node_reputation,
        "Starting reputation settler"
    );

    let (trigger, stop) = shutdown::channel();
    let mut tasks = ServiceTasks::new(health);
    tasks.spawn("synchronizer", synchronizer.run(stop.clone()));
    tasks.spawn(
        "reputation-query",
        serve_queries(
            bus,
            REPUTATION_QUERY_SUBJECT.to_string(),
            ReputationQuery(engine),
            stop,
        ),
    );

    tasks.supervise(wait_for_signal(), trigger).await;

    info!("Reputation settler stopped");
    Ok(())
}
