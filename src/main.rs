use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use soagent_provider::{CliProvider, McpConfigStore};
use soagent_server::{ChatOrchestrator, EventBus, ServerConfig};
use soagent_store::SessionStore;

#[derive(Parser)]
#[command(name = "soagent", about = "Agent conversation server")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Data directory (defaults to ~/.soagent).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_rx = soagent_telemetry::init();
    tracing::info!("starting soagent server");

    let data_dir = args.data_dir.unwrap_or_else(|| dirs_home().join(".soagent"));
    let store = Arc::new(SessionStore::open(&data_dir).context("failed to open session store")?);
    tracing::info!(path = %data_dir.display(), "session store opened");

    let bus = Arc::new(EventBus::new());
    let _drain = soagent_server::spawn_log_drain(bus.clone(), log_rx);

    let provider = Arc::new(CliProvider::from_env());
    let orchestrator = ChatOrchestrator::new(provider, store.clone(), bus.clone());
    let mcp = Arc::new(McpConfigStore::new(data_dir.join("mcp.json")));

    let config = ServerConfig { port: args.port };
    let handle = soagent_server::start(config, orchestrator, store, bus, mcp)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "soagent ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
