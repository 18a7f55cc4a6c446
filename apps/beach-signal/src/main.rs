use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use beach_signal::{
    auth::generate_secret_key,
    cli::{self, Cli, Commands},
    config::ServerConfig,
    handlers::build_router,
    registry::ConnectionRegistry,
    session::CloseReason,
    state::AppState,
    telemetry::Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenerateSecret) => {
            println!("{}", generate_secret_key());
            Ok(())
        }
        Some(Commands::Watch {
            url,
            token,
            duration,
        }) => {
            let _telemetry = Telemetry::init(false)?;
            cli::run_watch_client(url, token, duration).await
        }
        None => {
            let telemetry = Telemetry::init(true)?;
            let config = ServerConfig::try_from(cli.server)?;
            run(config, telemetry).await
        }
    }
}

async fn run(config: ServerConfig, telemetry: Telemetry) -> Result<()> {
    info!(
        listen_addr = %config.listen_addr,
        offer_policy = ?config.offer_policy,
        issuer_enabled = config.issuer_enabled,
        probe_interval_secs = config.heartbeat.probe_interval.as_secs(),
        idle_timeout_secs = config.heartbeat.idle_timeout.as_secs(),
        "starting beach-signal relay"
    );

    let state = AppState::from_config(&config, telemetry.metrics_handle())?;
    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-signal listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state.registry.clone()))
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C after closing every live session, so peers get a
/// close frame before the listener stops.
async fn shutdown_signal(registry: ConnectionRegistry) {
    let _ = signal::ctrl_c().await;
    let closed = registry.close_all(CloseReason::Shutdown);
    info!(closed, "closed live sessions for shutdown");
}
