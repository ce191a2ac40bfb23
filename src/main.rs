use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use syncmesh::config::{Config, StoreBackend};
use syncmesh::{ClusterFacade, ClusterNode, ClusterStore, MemoryStateSink, StateManager, TcpTransport};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "syncmesh", version, about = "Cluster membership node")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `cluster.minimum_nodes`
    #[arg(long)]
    minimum_nodes: Option<usize>,

    /// Override the publish binding
    #[arg(long = "pub")]
    publish: Option<String>,

    /// Override the router binding
    #[arg(long)]
    router: Option<String>,

    /// Use the Redis store at this URL instead of the configured backend
    #[arg(long)]
    redis: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(minimum_nodes) = args.minimum_nodes {
        config.cluster.minimum_nodes = minimum_nodes;
    }
    if let Some(publish) = &args.publish {
        config.cluster.bindings.publish = publish.clone();
    }
    if let Some(router) = &args.router {
        config.cluster.bindings.router = router.clone();
    }
    if let Some(url) = &args.redis {
        config.store.backend = StoreBackend::Redis;
        config.store.url = url.clone();
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT, leaving the cluster"),
        Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging.level);

    let store = match config.store.backend {
        StoreBackend::Embedded => {
            warn!("Using the embedded store: state is not shared with other processes");
            ClusterStore::embedded()?
        }
        StoreBackend::Redis => ClusterStore::redis(&config.store.url).await?,
    };
    let store = Arc::new(store);

    let sink = Arc::new(MemoryStateSink::new());
    let state = Arc::new(StateManager::new(Arc::clone(&store), sink));
    let transport = Arc::new(TcpTransport::new(&config.cluster.bindings)?);

    let node = Arc::new(
        ClusterNode::start(&config.cluster, store, transport, Arc::clone(&state)).await?,
    );
    let facade = ClusterFacade::new(Arc::clone(&node), state);

    match facade.health() {
        Ok(()) => info!(node = %node.id(), "Node ready"),
        Err(_) => info!(node = %node.id(), "Node started, waiting for quorum"),
    }

    tokio::select! {
        _ = shutdown_signal() => {
            node.shutdown().await?;
        }
        result = node.finished() => {
            result?;
        }
    }

    Ok(())
}
