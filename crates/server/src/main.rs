//! `relay-server` binary: CLI flags, config loading, wiring of every
//! collaborator, graceful shutdown.

use anyhow::Result;
use clap::{Parser, Subcommand};
use relay_auth::{AuthVerifier, ChallengeStore, JwtVerifier, StaticAgentKeyStore};
use relay_bus::BusClient;
use relay_common::{init_tracing_with_level, ServerConfig};
use relay_counters::{MessageCounter, UsageAggregator};
use relay_gateway::{AdminState, ConfiguredTenantLimits, GatewayState, HeartbeatMonitor, SessionManager};
use relay_registry::ConnectionRegistry;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "relay-server")]
#[command(version = "0.1.0")]
#[command(about = "Multi-tenant pub/sub gateway control plane")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, env = "RUST_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Server {
        /// Override the configured listen address.
        #[arg(long)]
        listen_addr: Option<String>,
    },
    /// Load and print the resolved configuration without starting anything.
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = cli.log_level.as_deref().unwrap_or("info");
    init_tracing_with_level(log_level)?;

    let config = ServerConfig::load(Some(&cli.config)).map_err(|e| {
        error!(error = %e, "failed to load configuration");
        e
    })?;

    match cli.command {
        Some(Commands::ValidateConfig) => {
            println!("configuration is valid");
            println!("  server_id: {}", config.server_id);
            println!("  listen_addr: {}", config.listen_addr);
            println!("  bus_url: {}", config.bus_url);
            Ok(())
        }
        Some(Commands::Server { listen_addr }) => {
            let mut config = config;
            if let Some(addr) = listen_addr {
                config.listen_addr = addr;
            }
            run_server(config).await
        }
        None => run_server(config).await,
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    info!(server_id = %config.server_id, listen_addr = %config.listen_addr, "relay-server starting");

    let bus = Arc::new(BusClient::new(config.bus_url.clone()));
    bus.connect().await?;

    let registry = Arc::new(ConnectionRegistry::connect(&config.counter_store_url, &config.registry_table).await?);
    let challenges = ChallengeStore::connect(&config.counter_store_url).await?;
    let jwt = JwtVerifier::new(&config.jwt_hmac_secret, &config.jwt_issuer, &config.jwt_audience);
    let keys = Arc::new(StaticAgentKeyStore::new());
    let auth = Arc::new(AuthVerifier::new(jwt, challenges, keys));

    let counters = Arc::new(MessageCounter::connect(&config.counter_store_url).await?);
    tokio::spawn(counters.clone().run_flush_loop());

    let aggregator = Arc::new(UsageAggregator::connect(&config.database_url, counters.clone()).await?);
    tokio::spawn(aggregator.clone().run_sweep_loop());

    let limits_pool = sqlx::PgPool::connect(&config.database_url).await.ok();
    let limits = Arc::new(ConfiguredTenantLimits::new(limits_pool));

    let sessions = Arc::new(SessionManager::new());
    Arc::new(HeartbeatMonitor::new(registry.clone(), sessions.clone())).spawn();

    let gateway_state = Arc::new(GatewayState {
        bus,
        registry: registry.clone(),
        auth,
        counters,
        sessions,
        limits,
        server_instance_id: config.server_id.clone(),
    });
    let admin_state = Arc::new(AdminState { registry, aggregator });

    let router = relay_gateway::build_router(gateway_state, admin_state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("relay-server shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
