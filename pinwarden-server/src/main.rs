mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use pinwarden_core::{
    IpfsHttpStore, JsonRpcChainClient, LifecycleEventSource, Orchestrator, SourceBuilder,
    SystemClock,
};
use server::{ServerState, run_server};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pinwarden")]
#[command(about = "Quota-aware pinning cache driven by registry events")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the configured sources and pin what they announce
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Validate a configuration file and exit
    CheckConfig {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pinwarden=info,pinwarden_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            tracing::info!("Starting pinwarden with config: {}", config);

            let cfg = load_config(&config);
            if let Err(error) = run(cfg).await {
                tracing::error!("pinwarden stopped: {}", error);
                std::process::exit(1);
            }
        }
        Commands::CheckConfig { config } => {
            let cfg = load_config(&config);
            if let Err(error) = build_sources(&cfg) {
                tracing::error!("Invalid source configuration: {}", error);
                std::process::exit(1);
            }
            tracing::info!(
                "Config {} is valid: limit {} bytes, {} sources",
                config,
                cfg.quota.limit_bytes,
                cfg.sources.len()
            );
        }
    }
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    }
}

fn build_sources(cfg: &Config) -> pinwarden_core::Result<Vec<Box<dyn LifecycleEventSource>>> {
    cfg.sources
        .iter()
        .map(|source| SourceBuilder::from_config(source).build())
        .collect()
}

async fn run(cfg: Config) -> pinwarden_core::Result<()> {
    let settings = cfg.orchestrator_settings()?;
    let sources = build_sources(&cfg)?;
    if sources.is_empty() {
        tracing::warn!("No event sources configured; only timers will run");
    }

    let store = IpfsHttpStore::new(
        &cfg.ipfs.api_url,
        Duration::from_secs(cfg.ipfs.request_timeout_secs),
    )?;
    let chain = JsonRpcChainClient::new(
        &cfg.chain.rpc_url,
        Duration::from_secs(cfg.chain.request_timeout_secs),
    )?;

    tracing::info!(
        "Limit: {} bytes per principal, lanes: fetch={} pin={} unpin={}",
        settings.limit,
        settings.throttle.fetch_concurrency,
        settings.throttle.pin_concurrency,
        settings.throttle.unpin_concurrency
    );

    let orchestrator = Orchestrator::new(
        Arc::new(store),
        Arc::new(chain),
        Arc::new(SystemClock),
        settings,
    );

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let http = match cfg.http.as_ref() {
        Some(http) => {
            let state = ServerState {
                snapshots: orchestrator.subscribe(),
            };
            let bind_addr = http.bind_addr.clone();
            let mut stop = stop_rx.clone();
            Some(tokio::spawn(async move {
                let shutdown = async move {
                    let _ = stop.wait_for(|stopped| *stopped).await;
                };
                if let Err(error) = run_server(&bind_addr, state, shutdown).await {
                    tracing::error!("Reporting server error: {}", error);
                }
            }))
        }
        None => None,
    };

    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", error);
            std::future::pending::<()>().await;
        }
    };

    let result = orchestrator.run(sources, shutdown).await;

    let _ = stop_tx.send(true);
    if let Some(handle) = http {
        let _ = handle.await;
    }

    result
}
