//! EMS Daemon
//!
//! Starts the order routing engine.
//!
//! # Usage
//!
//! ```bash
//! EMS_BROKERD=kraken=ws://127.0.0.1:7001 cargo run --bin emsd
//! ```
//!
//! # Environment Variables
//!
//! See `ems::infrastructure::config` for the `EMS_*` variables, plus:
//! - `OTEL_ENABLED`: export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: log filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use duplex_transport::WsConnector;
use ems::observability::{MetricsConfig, TelemetryConfig, init_metrics, telemetry};
use ems::{EmsConfig, SystemClock};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    load_dotenv();
    let _telemetry_guard =
        telemetry::init(TelemetryConfig::from_env()).context("failed to initialize telemetry")?;

    tracing::info!("Starting emsd");

    let config = EmsConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    if let Some(port) = config.metrics_port {
        init_metrics(&MetricsConfig::with_port(port))?;
    }

    let cancel = CancellationToken::new();
    let running = ems::start(
        &config,
        Arc::new(WsConnector::new()),
        Arc::new(SystemClock),
        &cancel,
    )
    .await?;
    tracing::info!(addr = %running.local_addr(), "emsd ready");

    shutdown_signal().await;
    cancel.cancel();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, running.join())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out, exiting anyway"
        );
    }

    tracing::info!("emsd stopped");
    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

fn log_config(config: &EmsConfig) {
    tracing::info!(
        listen_addr = %config.listen_addr,
        brokers = config.brokerds.len(),
        accounts = config.accounts.len(),
        default_broker = config.default_broker.as_deref().unwrap_or("-"),
        max_attempts = config.reconnect.max_attempts,
        client_name = %config.client_name,
        "Configuration loaded"
    );
    if config.brokerds.is_empty() {
        tracing::warn!("No brokers configured, every live order will fail with no route");
    }
}

/// Wait for SIGTERM or Ctrl+C. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
    }
}
