use lazywake::config::Config;
use lazywake::docker::DockerInstanceManager;
use lazywake::proxy::ProxyServer;
use lazywake::wake::WakeController;
use lazywake::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout is reserved for event responses
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lazywake=debug".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    // Usage: lazywake [event] [config.toml]
    let mut args = std::env::args().skip(1).peekable();
    let event_mode = args.next_if(|arg| arg == "event").is_some();
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("lazywake.toml"));

    let config = load_config(&config_path)?;

    if event_mode {
        return run_event(&config).await;
    }

    print_startup_banner(&config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;

    let instances = Arc::new(DockerInstanceManager::connect(&config.docker).await?);
    let controller = Arc::new(WakeController::new(&config, instances));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(bind_addr, controller, shutdown_rx);
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Read one function-URL event from stdin and write the response event to stdout
async fn run_event(config: &Config) -> anyhow::Result<()> {
    let mut event = String::new();
    tokio::io::stdin().read_to_string(&mut event).await?;

    let instances = Arc::new(DockerInstanceManager::connect(&config.docker).await?);
    let controller = WakeController::new(config, instances);
    let response = controller.handle_event(&event).await;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(response.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let (config, from_file) = Config::load_or_env(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    if from_file {
        info!(path = %path.display(), "Configuration loaded");
    } else {
        info!(path = %path.display(), "Configuration file not found, using environment");
    }
    Ok(config)
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

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        default_port = config.routes.default_port,
        default_health_path = %config.routes.default_health_path,
        named = config.routes.named.len(),
        slots = config.routes.slots.len(),
        default_backend = ?config.routes.default.as_ref().map(|d| d.backend.as_str()),
        "Routes"
    );
    info!(
        probe_timeout_secs = config.wake.probe_timeout_secs,
        running_poll_interval_secs = config.wake.running_poll_interval_secs,
        running_max_attempts = config.wake.running_max_attempts,
        post_start_probe_interval_secs = config.wake.post_start_probe_interval_secs,
        post_start_probe_attempts = config.wake.post_start_probe_attempts,
        forward_timeout_secs = config.wake.forward_timeout_secs,
        "Wake settings"
    );
    info!(
        host = ?config.docker.host,
        public_address_label = %config.docker.public_address_label,
        host_address = ?config.docker.host_address,
        "Docker settings"
    );
}
