mod engine;
mod session_commands;

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    herald_channels::{ChannelOutbound, ConversationEngine},
    herald_config::HeraldConfig,
    herald_whatsapp::{
        BridgeConnector, ConnectionState, CredentialStore, PairingOutcome, SessionRegistry,
        SledCredentialStore, render_terminal, spawn_idle_sweep,
    },
};

use crate::engine::LoggingEngine;

#[derive(Parser)]
#[command(name = "herald", about = "Herald, a persistent WhatsApp session gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file. Standard locations are searched when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the credential store.
    #[arg(long, global = true, env = "HERALD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9464).
    #[cfg(feature = "prometheus")]
    #[arg(long, global = true, env = "HERALD_METRICS_LISTEN")]
    metrics_listen: Option<std::net::SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore stored sessions and keep them connected until interrupted.
    Gateway,
    /// Pair a new session by scanning a QR code.
    Pair { session_id: String },
    /// Inspect or remove stored sessions (gateway must not be running).
    Sessions {
        #[command(subcommand)]
        action: session_commands::SessionAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[cfg(feature = "prometheus")]
fn init_metrics(cli: &Cli) -> anyhow::Result<()> {
    let Some(addr) = cli.metrics_listen else {
        return Ok(());
    };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("failed to start metrics listener on {addr}"))?;
    info!(%addr, "prometheus metrics enabled");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<HeraldConfig> {
    match &cli.config {
        Some(path) => herald_config::load_config(path),
        None => Ok(herald_config::discover_and_load()),
    }
}

/// Open the sled credential store under the resolved data directory.
fn open_store(cli: &Cli, config: &HeraldConfig) -> anyhow::Result<Arc<dyn CredentialStore>> {
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| config.storage.data_dir.clone())
        .unwrap_or_else(herald_config::data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let path = data_dir.join("credentials");
    let store = SledCredentialStore::open(&path)
        .with_context(|| format!("failed to open credential store at {}", path.display()))?;
    info!(path = %path.display(), "credential store opened");
    Ok(Arc::new(store))
}

async fn build_registry(cli: &Cli, config: &HeraldConfig) -> anyhow::Result<SessionRegistry> {
    let store = open_store(cli, config)?;
    let connector = Arc::new(BridgeConnector::from_config(&config.bridge, &config.whatsapp));
    let registry = SessionRegistry::new(store, connector, &config.whatsapp);
    let engine = LoggingEngine::new(
        Arc::new(registry.clone()) as Arc<dyn ChannelOutbound>,
        &config.conversation.auto_reply,
    );
    registry
        .set_engine(Arc::new(engine) as Arc<dyn ConversationEngine>)
        .await;
    Ok(registry)
}

async fn run_gateway(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let registry = build_registry(cli, &config).await?;

    let report = registry.restore().await?;
    for (id, e) in &report.errors {
        warn!(session_id = %id, error = %e, "session not restored");
    }
    let sweep = spawn_idle_sweep(
        registry.clone(),
        config.conversation.sweep_interval(),
        config.conversation.idle_timeout(),
    );
    info!(
        bridge = %config.bridge.url,
        sessions = report.restored.len(),
        "gateway running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    registry.shutdown().await;
    sweep.await?;
    Ok(())
}

async fn run_pair(cli: &Cli, session_id: &str) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let registry = build_registry(cli, &config).await?;

    let result = pair(&registry, session_id).await;
    registry.shutdown().await;
    result
}

async fn pair(registry: &SessionRegistry, session_id: &str) -> anyhow::Result<()> {
    match registry.create_with_pairing(session_id).await? {
        PairingOutcome::Authenticated => {
            println!("Session {session_id} is already paired.");
            return Ok(());
        },
        PairingOutcome::Code { qr, .. } => {
            println!("{}", render_terminal(&qr)?);
            println!("Scan the code with WhatsApp > Linked devices. It expires shortly.");
        },
    }

    let mut state = registry
        .subscribe(session_id)
        .await
        .with_context(|| format!("session {session_id} ended before it could be scanned"))?;
    loop {
        if *state.borrow_and_update() == ConnectionState::Authenticated {
            println!("Session {session_id} paired.");
            return Ok(());
        }
        if state.changed().await.is_err() || registry.get(session_id).await.is_none() {
            anyhow::bail!("pairing for {session_id} was not completed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "herald starting");
    #[cfg(feature = "prometheus")]
    init_metrics(&cli)?;

    match &cli.command {
        Commands::Gateway => run_gateway(&cli).await,
        Commands::Pair { session_id } => run_pair(&cli, session_id).await,
        Commands::Sessions { action } => {
            let config = load_config(&cli)?;
            let store = open_store(&cli, &config)?;
            session_commands::handle_sessions(action, store.as_ref()).await
        },
    }
}
