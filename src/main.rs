//! sticky-cluster - runs an echo service behind a sticky process cluster
//!
//! The same executable is the master and, re-executed by it, every worker.

use clap::Parser;
use std::sync::Arc;
use tracing::info;

use sticky_cluster::{Args, ClusterError, ClusterOrchestrator, ConnectionHandler, EchoHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let config = args.load_config()?;
    sticky_cluster::logging::init(&config.logging)?;

    let orchestrator = ClusterOrchestrator::new(config.cluster)?;
    let exit = orchestrator
        .start(
            |options| async move {
                info!("======================================");
                info!("  sticky-cluster");
                info!("======================================");
                info!("Listen: {}:{}", options.host, options.port);
                info!("Workers: {}", options.concurrency);
                info!("Prefix: {}", options.prefix);
                info!("Hard shutdown after: {}ms", options.hard_shutdown_delay_ms);
                info!("======================================");
                Ok::<_, ClusterError>(())
            },
            |context| async move {
                let handler: Arc<dyn ConnectionHandler> = Arc::new(EchoHandler::new(&context));
                Ok::<_, ClusterError>(handler)
            },
        )
        .await?;

    info!(?exit, "Exiting");
    std::process::exit(exit.exit_code());
}
