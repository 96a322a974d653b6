//! fleetsim Fleet Simulator
//!
//! Serves a simulated compute fleet to autoscaling controllers. Only the
//! elected replica mutates the fleet, backs it up and runs chaos; followers
//! serve reads and report themselves unready.

use std::sync::Arc;

use anyhow::{bail, Result};
use fleetsim_simulator::{
    api,
    config::{Config, ElectionConfig},
    election::{Elector, SqliteLeaseElector, StandaloneElector},
    runtime::SimulatedRuntime,
    simulator::{Simulator, SimulatorConfig},
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEETSIM_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(replica_id = %config.replica_id, "Starting fleet simulator");
    info!(
        listen_addr = %config.listen_addr,
        storage = ?config.storage,
        election = ?config.election,
        "Configuration loaded"
    );

    let storage = match config.storage.open() {
        Ok(storage) => storage,
        Err(e) => {
            error!(error = %e, "Failed to open snapshot storage");
            return Err(e.into());
        }
    };

    let runtime = Arc::new(SimulatedRuntime::new(
        config.boot_delay,
        config.shutdown_delay,
    ));

    // A corrupt snapshot is fatal: nothing is served from a guessed state.
    let simulator =
        match Simulator::bootstrap(SimulatorConfig::from(&config), storage, runtime).await {
            Ok(simulator) => simulator,
            Err(e) => {
                error!(error = %e, "Startup restore failed");
                return Err(e.into());
            }
        };

    let elector: Arc<dyn Elector> = match &config.election {
        ElectionConfig::Standalone => Arc::new(StandaloneElector),
        ElectionConfig::Lease {
            path,
            duration,
            renew_interval,
        } => Arc::new(SqliteLeaseElector::open(
            path,
            config.replica_id,
            *duration,
            *renew_interval,
        )?),
    };

    let handle = simulator.start(elector);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = api::create_router(AppState::new(&simulator));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                info!("HTTP server shutting down");
            })
            .await
    });

    let mut lost_leadership = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = handle.lost() => {
            error!("Leadership lost; shutting down");
            lost_leadership = true;
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Workers and the elector stop before the listener goes away, so a
    // final backup is still taken while this replica holds leadership.
    info!("Waiting for workers to shut down...");
    let result = handle.shutdown().await;

    let _ = shutdown_tx.send(true);
    if !server_handle.is_finished() {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(10), server_handle).await;
    }

    if let Err(e) = result {
        error!(error = %e, "Simulator shutdown failed");
        return Err(e.into());
    }
    if lost_leadership {
        bail!("leadership lost");
    }

    info!("Fleet simulator shutdown complete");
    Ok(())
}
