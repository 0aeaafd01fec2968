//! Worker node agent: connects to the coordinator and executes jobs.

use std::path::PathBuf;

use clap::Parser;

use muster::worker::{WorkerConfig, run_worker};
use muster::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "muster-node", about = "muster worker node agent")]
struct Args {
    /// Coordinator host to connect to.
    #[arg(long, env = "MUSTER_COORDINATOR_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Coordinator worker port.
    #[arg(long, env = "MUSTER_COORDINATOR_PORT", default_value_t = 8000)]
    port: u16,

    /// Node name, unique across the fleet (e.g. node0).
    #[arg(long, env = "MUSTER_NODE_NAME")]
    name: String,

    /// Directory holding completed model artifacts.
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// Directory holding the training data.
    #[arg(long, default_value = "images")]
    data_dir: PathBuf,

    /// Training engine command.
    #[arg(long, default_value = "python3 train.py")]
    train_engine: String,

    /// Inference engine command.
    #[arg(long, default_value = "python3 inference.py")]
    infer_engine: String,

    /// Seconds between keepalive pings.
    #[arg(long, default_value_t = 30)]
    ping_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = WorkerConfig::new(args.host, args.port, args.name);
    config.models_dir = args.models_dir;
    config.data_dir = args.data_dir;
    config.train_engine = split_command(&args.train_engine);
    config.infer_engine = split_command(&args.infer_engine);
    config.ping_interval = std::time::Duration::from_secs(args.ping_interval_secs);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    run_worker(config, shutdown).await?;
    Ok(())
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
