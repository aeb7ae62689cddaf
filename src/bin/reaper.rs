//! lazywake-reaper - stops instances that have been idle over the reap window
//!
//! Usage:
//!   lazywake-reaper [config.toml]
//!
//! Samples container stats every `sample_interval_secs` and runs a reap pass
//! every `reap_interval_secs` until SIGINT/SIGTERM.

use lazywake::config::Config;
use lazywake::docker::{DockerInstanceManager, DockerMetrics};
use lazywake::instance::InstanceManager;
use lazywake::reaper::IdleReaper;
use lazywake::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lazywake=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("lazywake.toml"));

    let (config, from_file) = Config::load_or_env(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    if from_file {
        info!(path = %config_path.display(), "Configuration loaded");
    }

    let reaper_config = config.reaper.clone();
    info!(name = PKG_NAME, version = VERSION, "Starting idle reaper");
    info!(
        window_secs = reaper_config.window_secs,
        cpu_threshold_percent = reaper_config.cpu_threshold_percent,
        network_threshold_bytes = reaper_config.network_threshold_bytes,
        instance_types = ?reaper_config.instance_types,
        sample_interval_secs = reaper_config.sample_interval_secs,
        reap_interval_secs = reaper_config.reap_interval_secs,
        "Reaper settings"
    );

    let instances = Arc::new(DockerInstanceManager::connect(&config.docker).await?);

    // History must reach one sample interval past the window for a baseline
    let retention = reaper_config.window() + reaper_config.sample_interval() * 2;
    let metrics = Arc::new(DockerMetrics::new(instances.client(), retention));

    let reaper = IdleReaper::new(instances.clone(), metrics.clone(), reaper_config.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(reap_loop(
        reaper,
        instances,
        metrics,
        reaper_config.instance_type_set(),
        reaper_config.sample_interval(),
        reaper_config.reap_interval(),
        shutdown_rx,
    ));

    wait_for_shutdown_signal().await?;
    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    info!("Shutdown complete");
    Ok(())
}

async fn reap_loop(
    reaper: IdleReaper,
    instances: Arc<DockerInstanceManager>,
    metrics: Arc<DockerMetrics>,
    instance_types: std::collections::HashSet<String>,
    sample_interval: std::time::Duration,
    reap_interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut sample_tick = tokio::time::interval(sample_interval);
    let mut reap_tick = tokio::time::interval(reap_interval);
    // The first reap tick fires immediately; skip it so there is history to judge
    reap_tick.tick().await;

    loop {
        tokio::select! {
            _ = sample_tick.tick() => {
                let manager: &dyn InstanceManager = instances.as_ref();
                if let Err(e) = metrics.sample_running(manager, &instance_types).await {
                    warn!(error = %e, "Failed to sample running instances");
                }
            }
            _ = reap_tick.tick() => {
                match reaper.run_once().await {
                    Ok(report) => info!(
                        evaluated = report.evaluated,
                        stopped = ?report.stopped,
                        failed = ?report.failed,
                        "Reap pass finished"
                    ),
                    Err(e) => error!(error = %e, "Reap pass failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Reaper shutting down");
                    break;
                }
            }
        }
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}
