//! RoomGuard machine room monitor.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{RUN_MODE}.toml, $ROOMGUARD_CONFIG)
//! 2. Environment variables (prefixed with ROOMGUARD__)
//!
//! See `config.rs` for detailed configuration options.
//!
//! # Exit status
//!
//! 0 after a requested shutdown, 1 when startup fails (bad configuration),
//! 2 when the restart budget was exhausted.

use roomguard_monitor::logging::init_logging;
use roomguard_monitor::{MonitorConfig, Service};
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            return ExitCode::from(1);
        }
    };

    // Initialize logging
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::from(1);
    }

    info!(
        service = "roomguard-monitor",
        version = env!("CARGO_PKG_VERSION"),
        channels = config.sensors.channels.len(),
        "Starting machine room monitor"
    );

    // Validate configuration
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return ExitCode::from(1);
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    let service = match Service::new(config) {
        Ok(service) => service,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to start service");
            return ExitCode::from(1);
        }
    };

    let exit = service.run(shutdown).await;

    info!(exit_code = exit.code(), "Shutdown complete");
    ExitCode::from(exit.code())
}

/// Load configuration.
fn load_config() -> anyhow::Result<MonitorConfig> {
    // Try loading from files first, fall back to environment
    let config = MonitorConfig::load().or_else(|e| {
        eprintln!("Failed to load config from files ({}), trying environment", e);
        MonitorConfig::from_env()
    })?;

    Ok(config)
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("Initiating graceful shutdown...");
    shutdown.cancel();
}
