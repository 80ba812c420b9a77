//! labdaq daemon: runs the experiment manager together with a simulated
//! camera, for development and end-to-end exercise without hardware.

use anyhow::{Context, Result};
use clap::Parser;
use labdaq::camera::CameraEngine;
use labdaq::config::{DriverConfig, Settings};
use labdaq::error::DaqResult;
use labdaq::link::DeviceLink;
use labdaq::manager::Manager;
use labdaq::remote::{ClientConnector, RemoteClient};
use labdaq::sim::{SimCamera, SimDevice};
use labdaq::sink::{DiscardStorage, FrameBus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "labdaq", about = "Laboratory instrument control daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "labdaq.toml")]
    config: PathBuf,

    /// Override the data root directory.
    #[arg(long)]
    data_path: Option<PathBuf>,
}

/// Connector used when all drivers run in this process: nothing to dial.
struct LocalConnector;

#[async_trait::async_trait]
impl ClientConnector for LocalConnector {
    async fn connect(&self, name: &str) -> DaqResult<Arc<dyn RemoteClient>> {
        Err(labdaq::error::DaqError::Remote(format!(
            "no remote endpoint configured for {name}"
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut settings = Settings::load_from(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(data_path) = args.data_path {
        settings.storage.data_path = data_path;
    }
    info!(data_path = %settings.storage.data_path.display(), "starting labdaq");

    // Experiment manager.
    let manager_config = DriverConfig::open(&settings.storage.conf_path, "manager")?;
    let manager = Manager::new(
        settings.storage.data_path.clone(),
        manager_config,
        Arc::new(LocalConnector),
        vec!["manager".into(), "camera".into()],
        settings.manager.client_loop_interval,
    );
    manager.spawn_clients_loop();

    // Simulated instrument behind a device link, with keep-alive.
    let device = SimDevice::spawn().await?;
    let link = Arc::new(DeviceLink::new(
        "simcam-link",
        "127.0.0.1",
        device.addr().port(),
        b"\n",
        settings.link.clone(),
    ));
    link.connect().await?;
    let keepalive = link.clone().spawn_keep_alive(b"STATUS\n".to_vec());

    // Acquisition engine on a simulated camera.
    let camera_config = DriverConfig::open(&settings.storage.conf_path, "camera")?;
    let engine = CameraEngine::new(
        Arc::new(SimCamera::new("camera", 64, 48)),
        manager.clone(),
        Arc::new(DiscardStorage),
        Arc::new(FrameBus::default()),
        camera_config,
        settings.camera.clone(),
        settings.storage.data_path.clone(),
    )?;

    info!("ready; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    engine.shutdown().await?;
    manager.shutdown().await;
    link.shutdown().await;
    keepalive.abort();
    device.stop();
    Ok(())
}
