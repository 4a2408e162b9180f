use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use job_dispatcher::SERVICE_NAME;
use job_dispatcher::chain::{PaymentChainSource, PaymentEvent};
use job_dispatcher::engine::DispatchEngine;
use job_dispatcher::service::{JobsQuery, REDISPATCH_SUBJECT, Redispatch, consume_status_updates};
use market_framework::bus::NatsBus;
use market_framework::config::{BusArgs, HealthArgs, StoreArgs, SyncArgs, parse_address};
use market_framework::evm::EvmLogClient;
use market_framework::query::{JOBS_QUERY_SUBJECT, serve_queries};
use market_framework::repository::Repository;
use market_framework::shutdown::{self, wait_for_signal};
use market_framework::sync::EventSynchronizer;
use market_framework::tasks::ServiceTasks;
use market_framework::telemetry::init_tracing;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Turns escrowed jobs into provider assignments", long_about = None)]
struct Args {
    /// Payment chain RPC URL
    #[arg(long, env = "BSC_RPC_URL")]
    payment_rpc_url: String,

    /// JobManager contract address
    #[arg(long, env = "JOB_MANAGER_CONTRACT_ADDRESS")]
    job_manager: String,

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

    let contract = parse_address(&args.job_manager, "JobManager contract")?;
    let client = EvmLogClient::new(&args.payment_rpc_url, contract)?;

    let repo = Repository::new(&args.store.database_url)
        .await
        .context("Failed to initialize the Repository from the provided DB URL")?;
    info!("Applying pending migrations");
    repo.apply_migrations().await?;

    let bus = NatsBus::connect(&args.bus.nats_url)
        .await
        .context("Failed to connect to NATS")?;

    let health = args.health.serve(SERVICE_NAME, args.sync.range_size);
    let engine = DispatchEngine::new(repo.clone(), bus.clone());

    let mut synchronizer = EventSynchronizer::new(
        PaymentChainSource::new(client),
        engine.clone(),
        repo,
        vec![PaymentEvent::JobCreated],
        args.sync.sync_config(SERVICE_NAME),
    )
    .with_health(health.clone());
    synchronizer
        .initialize()
        .await
        .context("Failed to resolve the starting block")?;

    info!(
        rpc = %args.payment_rpc_url,
        contract = %contract,
        range_size = args.sync.range_size,
        "Starting job dispatcher"
    );

    let (trigger, stop) = shutdown::channel();
    let mut tasks = ServiceTasks::new(health);
    tasks.spawn("synchronizer", synchronizer.run(stop.clone()));
    tasks.spawn(
        "jobs-query",
        serve_queries(
            bus.clone(),
            JOBS_QUERY_SUBJECT.to_string(),
            JobsQuery(engine.clone()),
            stop.clone(),
        ),
    );
    tasks.spawn(
        "redispatch",
        serve_queries(
            bus.clone(),
            REDISPATCH_SUBJECT.to_string(),
            Redispatch(engine.clone()),
            stop.clone(),
        ),
    );
    tasks.spawn("status-updates", consume_status_updates(engine, bus, stop));

    tasks.supervise(wait_for_signal(), trigger).await;

    info!("Job dispatcher stopped");
    Ok(())
}
