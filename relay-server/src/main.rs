use anyhow::{Context, Result};
use clap::Parser;
use relay_server::{
    JsonlReaderFactory, LogService, LoggingConfig, RelayConfig, RelayNode, ServiceRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-server", version, about = "Clustered change-stream relay node")]
struct Args {
    /// YAML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };

    init_tracing(&config.logging);
    info!("Starting relay-server v{}", env!("CARGO_PKG_VERSION"));

    let services = Arc::new(ServiceRegistry::new());
    services.register(Arc::new(LogService::new("log")));

    let factory = Arc::new(JsonlReaderFactory::new(
        config.reader.source_path.clone(),
        config.reader.poll_interval(),
    ));

    let shutdown = CancellationToken::new();
    let node = RelayNode::start(config, factory, services, shutdown.clone())
        .await
        .context("starting relay node")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Signal handler failed: {}", e);
            }
            info!("Interrupt received");
        }
        _ = node.stopped() => info!("Stop requested"),
    }

    node.shutdown().await;
    info!("relay-server stopped");
    Ok(())
}
