use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use turnstile::config::{StoreBackend, StoreConfig, TurnstileConfig};
use turnstile::credentials::generate_api_key;
use turnstile::http::{router, HttpServer, RouteLimiters};
use turnstile::store::{
    CounterStore, MemoryCounterStore, RedisCounterStore, RedisStoreConfig, TimeoutStore,
};

/// How often the in-process store drops expired counters.
const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "turnstile", version, about = "Fixed-window admission control for HTTP services")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service (default)
    Serve {
        /// YAML configuration file; TURNSTILE__* environment variables override it
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print a freshly generated API key
    IssueKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command.unwrap_or(Command::Serve { config: None }) {
        Command::Serve { config } => serve(config).await,
        Command::IssueKey => {
            println!("{}", generate_api_key());
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Starting Turnstile admission control service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(config_path.as_deref())?;
    info!(
        bind_addr = %config.server.bind_addr,
        backend = ?config.store.backend,
        global_limit = config.rate_limits.global.limit,
        uploads_limit = config.rate_limits.uploads.limit,
        "Configuration loaded"
    );

    let store = build_store(&config.store).await?;
    let limiters =
        RouteLimiters::from_config(&config.rate_limits, store, config.store.atomic_expiry)?;
    info!("Rate limiters initialized");

    let app = router(&limiters, config.server.trust_forwarded_for);
    HttpServer::new(config.server.bind_addr, app)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Turnstile admission control service stopped");
    Ok(())
}

async fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let redis_config = RedisStoreConfig {
                key_prefix: config.key_prefix.clone(),
                ..Default::default()
            };
            let redis = RedisCounterStore::connect_with_config(&config.url, redis_config).await?;
            redis.ping().await?;
            info!(timeout_ms = config.timeout_ms, "Using Redis counter store");
            Ok(Arc::new(TimeoutStore::new(redis, config.timeout())))
        }
        StoreBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::new());
            let purge_store = store.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MEMORY_PURGE_INTERVAL);
                loop {
                    interval.tick().await;
                    purge_store.purge_expired();
                }
            });
            info!("Using in-process counter store; counts are not shared between instances");
            Ok(store)
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
