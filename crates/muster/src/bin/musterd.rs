//! Coordinator daemon: worker listener + HTTP front-end.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use muster::dispatcher;
use muster::pending::PendingRequests;
use muster::registry::NodeRegistry;
use muster::service::CoordinatorService;
use muster::transport::http::{HttpConfig, serve};

#[derive(Debug, Parser)]
#[command(name = "musterd", about = "muster fleet coordinator")]
struct Args {
    /// Bind address for both listeners.
    #[arg(long, env = "MUSTER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port workers connect to.
    #[arg(long, env = "MUSTER_NODE_PORT", default_value_t = 8000)]
    node_port: u16,

    /// Port of the HTTP front-end.
    #[arg(long, env = "MUSTER_API_PORT", default_value_t = 8001)]
    api_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let registry = Arc::new(NodeRegistry::new());
    let pending = PendingRequests::new();

    // Listener setup failure is the one fatal error at startup.
    let listener = TcpListener::bind((args.host.as_str(), args.node_port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "worker listener bound");
    tokio::spawn(dispatcher::run_listener(
        listener,
        Arc::clone(&registry),
        Arc::clone(&pending),
    ));

    let service = Arc::new(CoordinatorService::new(registry, pending));
    serve(
        HttpConfig {
            host: args.host,
            port: args.api_port,
        },
        service,
    )
    .await
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
