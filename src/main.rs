use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use manifest_mirror::config::MirrorConfig;
use manifest_mirror::health;
use manifest_mirror::run::Mirror;

#[tokio::main]
async fn main() -> Result<()> {
    // `manifest-mirror healthcheck` — exit 0 if HEALTH_FILE is fresh, 1 otherwise.
    // Designed for use as a Kubernetes exec liveness probe (no shell needed).
    if std::env::args().nth(1).as_deref() == Some("healthcheck") {
        let path = std::env::var("HEALTH_FILE").unwrap_or_else(|_| "/tmp/health".to_string());
        let meta = std::fs::metadata(&path)?;
        let age = meta.modified()?.elapsed().unwrap_or(Duration::MAX);
        if age < Duration::from_secs(60) {
            std::process::exit(0);
        }
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MirrorConfig::from_env().map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;

    let health_path = config
        .health_file
        .as_deref()
        .or_else(|| config.health_port.map(|_| "/tmp/health"))
        .map(std::path::PathBuf::from);

    let _health_touch = if let Some(ref path) = health_path {
        // Touch once synchronously so readiness probes pass immediately.
        health::touch(path).await.context("initial health file touch")?;
        Some(health::spawn_health_touch(path.clone()))
    } else {
        None
    };

    let _health_server = if let Some(port) = config.health_port {
        let path = health_path
            .clone()
            .context("health_path must be set when health_port is configured")?;
        Some(health::spawn_health_server(port, path))
    } else {
        None
    };

    let mirror = Mirror::open(config).await?;

    // On interrupt: in-flight work is abandoned, committed versions stay
    // durable, account timestamps are not advanced.
    let shutdown = mirror.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, winding down");
            shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    // The provider collaborators (session, product info, transport) are
    // supplied by the embedding that links this crate; the standalone binary
    // drives the provider-independent operations.
    mirror.run_maintenance().await
}
