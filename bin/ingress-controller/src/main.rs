use anyhow::Result;
use ingress_core::Provider;
use ingress_kube::KubeStore;
use kube::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod sink;

use config::{ControllerConfig, LogFormat};

/// Snapshots buffered between the provider and the sink
const SNAPSHOT_BUFFER: usize = 16;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControllerConfig::load()?;
    init_tracing(config.log_format);

    info!("Starting ingress-controller...");

    let client = Client::try_default().await?;
    let store = Arc::new(KubeStore::new(client, &config.provider));

    let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
    let cancel = CancellationToken::new();

    let provider = Provider::new(store, config.provider.clone());
    let provider_task = tokio::spawn(provider.provide(tx, cancel.clone()));
    let sink_task = tokio::spawn(sink::run(rx, config.output_path.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");
    cancel.cancel();

    if let Err(e) = provider_task.await {
        error!("Ingress provider task failed: {}", e);
    }
    // The sink drains once the provider drops its sender
    if let Err(e) = sink_task.await {
        error!("Configuration sink task failed: {}", e);
    }

    Ok(())
}
