use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::prelude::*;

use hightd_agent::config;
use hightd_agent::docker::ContainerDriver;
use hightd_agent::http_api::{self, AppState};
use hightd_agent::registry::ServerRegistry;
use hightd_agent::remote::RemoteClient;
use hightd_agent::sftp;

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
    }
    // Containers intentionally outlive the agent; the next boot adopts them
    // during reconciliation.
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(config::load()?);
    let base = PathBuf::from(&config.path);
    std::fs::create_dir_all(&base)?;

    // Persist agent logs under the base path and keep stdout logs for
    // docker/dev.
    let log_dir = base.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "agent.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    let _file_guard = file_guard;

    if config.ssl {
        tracing::info!(
            cert = config.cert_path.as_deref().unwrap_or(""),
            "ssl configured; tls termination is handled by the embedding process"
        );
    }

    let docker = ContainerDriver::connect()?;
    let store_url = format!("sqlite://{}?mode=rwc", base.join("servers.db").display());
    let pool = hightd_store::open(&store_url).await?;

    let registry = ServerRegistry::open(base.clone(), docker, pool).await?;
    registry.reconcile().await?;

    let remote = RemoteClient::new(&config.remote, &config.token)?;

    let _sftp = sftp::spawn(config.sftp, base, registry.clone(), remote.clone()).await?;

    let state = AppState {
        config: config.clone(),
        registry,
        remote,
    };
    let app = http_api::router(state);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, port = config.port, "failed to bind control port");
            std::process::exit(1);
        }
    };
    tracing::info!(port = config.port, "control api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
