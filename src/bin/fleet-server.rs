/*!
 * fleet-server - Control plane for the fleetd device fleet
 *
 * Hosts the device registry and the update campaign orchestrator behind
 * one HTTP API: device registration and heartbeats, metric ingestion,
 * and campaign creation/pause/resume/cancel. Campaign state is durably
 * persisted, so a restarted server resumes unfinished rollouts.
 */

use anyhow::{Context, Result};
use clap::{Arg, Command};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use fleetd_core::config::ServerConfig;
use fleetd_server::{ApiState, CampaignOrchestrator, DeviceRegistry, ServerStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "fleet_server=info,fleetd_server=info".to_string()),
        )
        .init();

    let matches = Command::new("fleet-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("fleetd control plane: device registry and campaign orchestrator")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .help("Listen address, e.g. 0.0.0.0:8080"),
        )
        .arg(
            Arg::new("database")
                .short('d')
                .long("database")
                .value_name("PATH")
                .help("SQLite database path"),
        )
        .arg(
            Arg::new("secret-key")
                .long("secret-key")
                .value_name("KEY")
                .help("Operator bearer token for fleet-wide endpoints"),
        )
        .get_matches();

    // Env first, flags win
    let mut config = ServerConfig::from_env();
    if let Some(listen) = matches.get_one::<String>("listen") {
        config.listen_addr = listen.clone();
    }
    if let Some(database) = matches.get_one::<String>("database") {
        config.database_url = database.clone();
    }
    if let Some(key) = matches.get_one::<String>("secret-key") {
        config.secret_key = Some(key.clone());
    }

    let store = ServerStore::open(&config.database_path())
        .await
        .context("Failed to open server store")?;
    let registry = Arc::new(DeviceRegistry::new(store.clone()));
    let orchestrator = CampaignOrchestrator::new(store, config.campaign.clone());

    let resumed = orchestrator
        .resume_unfinished()
        .await
        .context("Failed to resume campaigns")?;
    if resumed > 0 {
        info!("Resumed {} unfinished campaigns", resumed);
    }

    // Background liveness sweep: devices past the heartbeat window go offline
    {
        let registry = registry.clone();
        let offline_after = Duration::from_secs(config.offline_after_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(offline_after / 2);
            loop {
                ticker.tick().await;
                match registry.sweep_offline(offline_after).await {
                    Ok(0) => {}
                    Ok(flipped) => info!("Marked {} devices offline", flipped),
                    Err(err) => warn!("Offline sweep failed: {:#}", err),
                }
            }
        });
    }

    let state = ApiState {
        registry,
        orchestrator,
        admin_key: config.secret_key.clone(),
    };
    let app = fleetd_server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("fleet-server listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    info!("fleet-server stopped");
    Ok(())
}
