//! # hygrolog-server
//!
//! Long-running daemon for the hygrolog sensor logger.
//!
//! This binary:
//! - Polls the configured BLE sensor on a fixed interval and stores readings
//! - Sweeps readings older than the retention window once a day
//! - Serves stored readings over a small REST API
//!
//! ## Running
//!
//! ```bash
//! # Development, with a simulated sensor
//! cargo run --package hygrolog-server --features mock-bluetooth
//!
//! # Production (on Raspberry Pi)
//! HYGROLOG_ENV=production ./hygrolog-server
//!
//! # Show the effective configuration
//! ./hygrolog-server --print-config
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

#[cfg(not(any(feature = "bluetooth", feature = "mock-bluetooth")))]
compile_error!("enable either the `bluetooth` or the `mock-bluetooth` feature");

use std::sync::Arc;

use hygrolog_core::{HygrologConfig, HygrologError, ShutdownTrigger, SqliteStore};
use hygrolog_server::state::AppState;
use hygrolog_server::{api, logging};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::is_production())?;

    let config = HygrologConfig::load().map_err(fatal)?;
    if std::env::args().skip(1).any(|arg| arg == "--print-config") {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting hygrolog-server");
    config.validate().map_err(fatal)?;

    let store = SqliteStore::open(config.storage.database_path.clone())
        .map_err(fatal)?;

    let (trigger, shutdown) = ShutdownTrigger::new();
    spawn_signal_listener(trigger)?;

    let http = if config.server.enabled {
        let addr = config.server.socket_addr()?;
        let state = AppState::new(store.clone(), config.server.tz()?).shared();
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", addr);

        let app = api::create_router(state);
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }))
    } else {
        info!("HTTP server disabled");
        None
    };

    let transport = transport(&config).await?;
    hygrolog_core::run(&config, transport, Arc::new(store), shutdown)
        .await
        .map_err(fatal)?;

    if let Some(http) = http {
        http.await??;
    }

    info!("hygrolog-server stopped");
    Ok(())
}

#[cfg(feature = "mock-bluetooth")]
#[allow(clippy::unused_async)]
async fn transport(_config: &HygrologConfig) -> anyhow::Result<hygrolog_core::MockTransport> {
    tracing::warn!("Using a simulated sensor (mock-bluetooth build)");
    Ok(hygrolog_core::MockTransport::simulated_sensor())
}

#[cfg(all(feature = "bluetooth", not(feature = "mock-bluetooth")))]
async fn transport(config: &HygrologConfig) -> anyhow::Result<hygrolog_core::BluezTransport> {
    let transport = hygrolog_core::BluezTransport::new(config.sensor.adapter.as_deref())
        .await
        .map_err(fatal)?;
    Ok(transport)
}

/// Log a core error with its code before it ends the process.
fn fatal(err: impl Into<HygrologError>) -> anyhow::Error {
    let err = err.into();
    tracing::error!(code = err.error_code(), error = %err, "hygrolog-server cannot continue");
    err.into()
}

/// Trigger shutdown on SIGINT or SIGTERM (Ctrl+C elsewhere).
fn spawn_signal_listener(trigger: ShutdownTrigger) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, initiating shutdown..."),
                _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown..."),
            }
            trigger.trigger();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Cannot listen for Ctrl+C");
                return;
            }
            info!("Received Ctrl+C, initiating shutdown...");
            trigger.trigger();
        });
    }

    Ok(())
}
