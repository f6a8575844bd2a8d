//! Consumer of published snapshots

use anyhow::{Context, Result};
use ingress_api::DynamicConfiguration;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Log every snapshot and, when `output` is set, write it there
pub async fn run(mut snapshots: mpsc::Receiver<DynamicConfiguration>, output: Option<PathBuf>) {
    while let Some(conf) = snapshots.recv().await {
        info!(
            http_routers = conf.http.routers.len(),
            http_services = conf.http.services.len(),
            middlewares = conf.http.middlewares.len(),
            tcp_routers = conf.tcp.routers.len(),
            certificates = conf.tls.certificates.len(),
            "Received configuration"
        );

        if let Some(path) = &output {
            if let Err(e) = write_snapshot(path, &conf).await {
                error!("Failed to write configuration: {:#}", e);
            }
        }
    }
    info!("Configuration stream closed");
}

/// Replace `path` with the pretty JSON form of `conf`. Readers never see a partial file.
pub async fn write_snapshot(path: &Path, conf: &DynamicConfiguration) -> Result<()> {
    let json = serde_json::to_vec_pretty(conf)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &json)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to move {} to {}", tmp.display(), path.display()))?;
    Ok(())
}
