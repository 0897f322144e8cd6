use std::sync::Arc;

use clap::Parser;
use g2_channels::{ChannelRegistry, LoopbackChannel};
use g2_core::config::Config;
use g2_orchestrator::{Orchestrator, StoreInboundSink};
use g2_store::StateStore;

/// Chat-driven agent orchestrator: watches registered groups for trigger
/// messages, runs scheduled tasks, and relays container output back to chat.
#[derive(Parser, Debug)]
#[command(name = "g2", version, about)]
struct Cli {
    /// Overrides DATA_DIR for this run.
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Alternate .env-style file to load instead of `./.env`.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Run a single pipeline/scheduler/IPC pass and exit, instead of serving.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), g2_core::Error> {
    g2_core::logging::init("g2")?;

    let cli = Cli::parse();
    if let Some(config_path) = &cli.config {
        load_env_file(config_path);
    }
    if let Some(data_dir) = &cli.data_dir {
        std::env::set_var("DATA_DIR", data_dir);
    }

    let config = Config::load()?;
    let store = StateStore::open(&config.store_path())?;
    let sink = Arc::new(StoreInboundSink::new(store.clone()));

    let mut channels = ChannelRegistry::new();
    channels
        .register(Arc::new(LoopbackChannel::with_sink("loopback", sink)))
        .map_err(|e| g2_core::Error::External(e.to_string()))?;
    let channels = Arc::new(channels);

    let orchestrator = Orchestrator::with_store(config, channels, store)?;

    if cli.once {
        orchestrator.run_once().await
    } else {
        orchestrator.run().await
    }
}

fn load_env_file(path: &std::path::Path) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let key = k.trim();
            if !key.is_empty() && std::env::var_os(key).is_none() {
                std::env::set_var(key, v.trim().trim_matches('"'));
            }
        }
    }
}
