use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use tailgate::{run_server, shutdown, ws, AppState, Config};
use tailgate_core::{BackendFactory, Hub};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_filter()))
        .json()
        .init();

    let kind = config.validate().context("invalid configuration")?;
    let layout = config.layout();

    info!(
        backend = %kind,
        data_dir = ?config.data_dir,
        log_pattern = %config.log_pattern,
        listen_addr = %config.listen_addr,
        "tailgate starting"
    );

    let backend = BackendFactory::create(kind, &config.backend_settings());
    let hub = Hub::new(backend, layout.clone(), config.hub_settings());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");

    let refresh = ws::schedule_refresh(Arc::clone(&hub), config.refresh_delay());
    let state = AppState::new(Arc::clone(&hub), layout, config.refresh_interval());

    let served = run_server(listener, state, shutdown::shutdown_signal()).await;
    refresh.abort();
    served.context("server error")?;
    info!("tailgate stopped");
    Ok(())
}
