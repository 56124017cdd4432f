use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stampede::{
    gateway::Gateway,
    generator::{self, Generator},
    manager::{
        api::{self, Api},
        service::AttackService,
        stream,
    },
    scenario::{self, Scenario},
};

/// Buckets of the request-duration histogram, in seconds.
const REQUEST_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0, 1.1, 1.2, 1.3,
    1.4, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5, 5.0, 10.0,
];

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("REST server error: {0}")]
    Api(#[from] api::Error),
    #[error("stream listener error: {0}")]
    Stream(#[from] stream::Error),
    #[error("gateway error: {0}")]
    Gateway(#[from] stampede::gateway::Error),
    #[error("failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Parser)]
#[command(version, about = "Distributed load-generation coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the manager: REST surface, node stream listener and attack
    /// coordination.
    Manager(ManagerArgs),
    /// Run a worker node: connect to the manager and generate load.
    Node(NodeArgs),
}

#[derive(Args)]
struct ManagerArgs {
    /// REST listen address
    #[arg(long, env = "SERVER_HOST", default_value = "localhost:8080")]
    server_host: String,
    /// Listen address for node streams
    #[arg(long = "manager-host", env = "GRPC_MANAGER_HOST", default_value = "localhost:5000")]
    manager_host: String,
    /// Prometheus exposition port
    #[arg(long, env = "METRICS_PORT", default_value_t = 4000)]
    metrics_port: u16,
    /// Seconds between re-emissions of an unacknowledged operation
    #[arg(long, env = "RETRY_INTERVAL_SEC", default_value_t = 10)]
    retry_interval_sec: u64,
    /// Grace window for node reconnects, in seconds
    #[arg(long, env = "RECOVERY_INTERVAL_SEC", default_value_t = 60)]
    recovery_interval_sec: u64,
    /// Per-node pending-operation queue capacity
    #[arg(long, env = "OP_QUEUE_CAPACITY", default_value_t = 1000)]
    op_queue_capacity: usize,
}

#[derive(Args)]
struct NodeArgs {
    /// Manager stream address to dial
    #[arg(long = "manager-host", env = "GRPC_MANAGER_HOST", default_value = "localhost:5000")]
    manager_host: String,
    /// Prometheus exposition port
    #[arg(long, env = "METRICS_PORT", default_value_t = 4002)]
    metrics_port: u16,
    /// Self-declared node name
    #[arg(long, env = "NODE_NAME", default_value = "node1")]
    node_name: String,
    /// Number of users sharing a single HTTP client
    #[arg(long, env = "GENERATOR_USERS_PER_CLIENT", default_value_t = 15)]
    generator_users_per_client: i64,
    /// Lower bound of the per-client idle-connection timeout, in seconds
    #[arg(long, env = "GENERATOR_MIN_IDLE_CONN_TIMEOUT_SEC", default_value_t = 10)]
    generator_min_idle_conn_timeout_sec: u64,
    /// Upper bound of the per-client idle-connection timeout, in seconds
    #[arg(long, env = "GENERATOR_MAX_IDLE_CONN_TIMEOUT_SEC", default_value_t = 60)]
    generator_max_idle_conn_timeout_sec: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Manager(args) => run_manager(args).await,
        Commands::Node(args) => run_node(args).await,
    }
}

fn install_metrics(port: u16) -> Result<(), Error> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("request_duration_seconds".to_string()),
            REQUEST_DURATION_BUCKETS,
        )?
        .install()?;

    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = terminate.recv() => info!("terminate received"),
    }
    cancel.cancel();
}

async fn run_manager(args: ManagerArgs) -> Result<(), Error> {
    install_metrics(args.metrics_port)?;

    let service = AttackService::new(Duration::from_secs(args.recovery_interval_sec));
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let api = Api::new(
        service.clone(),
        api::Config {
            listen_addr: args.server_host,
        },
    );
    let streams = stream::Server::new(
        service,
        stream::Config {
            listen_addr: args.manager_host,
            op_queue_capacity: args.op_queue_capacity,
            retry_interval_sec: args.retry_interval_sec,
        },
    );

    let api_task = tokio::spawn(api.run(shutdown.clone()));
    let stream_task = tokio::spawn(streams.run(shutdown));

    let (api_result, stream_result) = tokio::try_join!(api_task, stream_task)?;
    api_result?;
    stream_result?;

    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<(), Error> {
    install_metrics(args.metrics_port)?;

    let scenarios = scenario::registry();
    let advertised = scenarios.values().map(Scenario::details).collect();
    let generator = Generator::new(
        generator::Config {
            users_per_client: args.generator_users_per_client,
            min_idle_conn_timeout_sec: args.generator_min_idle_conn_timeout_sec,
            max_idle_conn_timeout_sec: args.generator_max_idle_conn_timeout_sec,
        },
        scenarios,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let gateway = Gateway::new(args.manager_host, args.node_name, advertised, generator);
    gateway.run(shutdown).await?;

    Ok(())
}
