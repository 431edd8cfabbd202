//! OCPP mirroring proxy entry point.
//!
//! Reads configuration from TOML (path from `OCPP_PROXY_CONFIG` or the
//! platform config dir), starts the alert dispatcher and the listener,
//! and exits cleanly on SIGINT/SIGTERM.

use std::process::ExitCode;

use tracing::{error, info};

use ocpp_mirror::notify::Notifier;
use ocpp_mirror::support::shutdown::ShutdownSignal;
use ocpp_mirror::{default_config_path, AppConfig, ProxyServer, SessionRegistry};

#[tokio::main]
async fn main() -> ExitCode {
    // ── Load configuration ─────────────────────────────────────
    let config_path = std::env::var("OCPP_PROXY_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_path());

    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("Configuration loaded from {}", config_path.display());
    info!("Starting OCPP mirroring proxy...");
    for upstream in config.upstreams() {
        info!(name = %upstream.name, url = %upstream.base_url, "configured upstream");
    }

    // ── Alert dispatcher ───────────────────────────────────────
    let notify_sink = Notifier::new(config.notify.clone()).start();
    info!("🔔 Alert dispatcher started");

    // ── Shutdown coordination ──────────────────────────────────
    let shutdown_signal = ShutdownSignal::new();
    shutdown_signal.listen_to_os_signals();

    // ── Listener ───────────────────────────────────────────────
    let registry = SessionRegistry::shared();
    let server =
        ProxyServer::new(config, registry, notify_sink).with_shutdown(shutdown_signal.clone());

    info!("🚀 Proxy started. Press Ctrl+C to shut down gracefully.");

    match server.run().await {
        Ok(()) => {
            info!("👋 OCPP mirroring proxy shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
