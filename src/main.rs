use runnergate::api::{PKG_NAME, VERSION};
use runnergate::config::Config;
use runnergate::gateway::Gateway;
use runnergate::pool::PoolConfig;
use runnergate::server::GatewayServer;
use runnergate::telemetry::{TelemetrySink, UdpTelemetry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("runnergate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("runnergate.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    let telemetry: Option<Arc<dyn TelemetrySink>> = match config.telemetry.udp_target {
        Some(target) => Some(Arc::new(UdpTelemetry::connect(target).await?)),
        None => None,
    };

    let gateway = Arc::new(Gateway::open(&config.cluster, telemetry)?);
    match gateway.synchronize().await {
        Ok(report) if !report.errors.is_empty() => {
            warn!(errors = ?report.errors, "Some runners did not answer the initial refresh");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Initial refresh failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let server = GatewayServer::new(config.server.bind_addr()?, Arc::clone(&gateway), shutdown_rx)
        .with_pool_config(pool_config)
        .with_request_timeout(config.server.request_timeout());

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
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

    let _ = shutdown_tx.send(true);
    if let Err(e) = server_handle.await {
        error!(error = %e, "Gateway server task failed");
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        state_file = %config.cluster.state_file.display(),
        refresh_timeout_secs = config.cluster.refresh_timeout_secs,
        system_timeout_secs = config.cluster.system_timeout_secs,
        aggregate_timeout_secs = config.cluster.aggregate_timeout_secs,
        create_timeout_secs = config.cluster.create_timeout_secs,
        "Cluster settings"
    );
    if let Some(target) = config.telemetry.udp_target {
        info!(%target, "Telemetry target");
    }
}
