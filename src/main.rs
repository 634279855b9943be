mod buffer;
mod catalog;
mod config;
mod gateway;
mod metadata;
mod orchestrator;
mod transcode;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::buffer::BroadcastBuffer;
use crate::config::Settings;
use crate::gateway::GatewayState;
use crate::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wavecast=info")),
        )
        .init();

    let mut settings = Settings::load().context("failed to load configuration")?;
    // An explicit library root on the command line beats the configured one.
    if let Some(root) = std::env::args().nth(1) {
        settings.library.root = root.into();
    }
    settings.validate().map_err(anyhow::Error::msg)?;

    let catalog = catalog::build(&settings.library.root, &settings.library)
        .context("failed to build the catalog")?;
    info!(
        tracks = catalog.len(),
        root = %settings.library.root.display(),
        "catalog built"
    );

    let buffer = Arc::new(BroadcastBuffer::new(
        settings.broadcast.capacity_bytes,
        Duration::from_secs(settings.broadcast.pacing_window_secs),
    ));
    let orchestrator = Orchestrator::spawn(catalog, buffer.clone(), settings.playback.clone());

    let state = GatewayState {
        buffer,
        now_playing: orchestrator.now_playing(),
        station: settings.station.clone(),
    };
    let addr = format!("{}:{}", settings.station.bind, settings.station.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tokio::select! {
        result = gateway::serve(listener, state) => {
            result.context("gateway terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            orchestrator.stop();
            let _ = tokio::task::spawn_blocking(move || orchestrator.join()).await;
        }
    }
    Ok(())
}
