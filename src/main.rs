//! camhub launcher: hosts one camera server under a restart supervisor

use std::path::PathBuf;
use std::sync::Arc;

use camhub::configuration::Configuration;
use camhub::driver::{CameraDriver, DriverContext, DriverKind, ImageDriver, PatternDriver, StreamLayout};
use camhub::registry::{MemoryRegistry, RedisRegistry, Registry};
use camhub::{keys, CameraClient, CameraServer, Command, Config, Supervisor};
use clap::Parser;
use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Shared-memory camera frame server", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Index of the device to open
    #[arg(short, long)]
    device: Option<u32>,

    /// Address of the key-value store; without it the registry is in-process
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port of the key-value store
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long, value_enum)]
    driver: Option<DriverKind>,

    /// Stream layout of the pattern driver
    #[arg(long, value_enum)]
    layout: Option<StreamLayout>,

    /// Image file for the image driver, repeatable
    #[arg(long = "source")]
    sources: Vec<PathBuf>,

    /// Directory the save command writes device configurations into
    #[arg(long)]
    persist_dir: Option<PathBuf>,

    /// Log the reported frame rate once per status interval
    #[arg(long)]
    monitor: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(index) = self.device {
            config.driver.index = index;
        }
        if let Some(host) = &self.host {
            config.registry.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.registry.port = port;
        }
        if let Some(kind) = self.driver {
            config.driver.kind = kind;
        }
        if let Some(layout) = self.layout {
            config.driver.layout = layout;
        }
        if let Some(dir) = &self.persist_dir {
            config.server.persist_dir = Some(dir.clone());
        }
        if !self.sources.is_empty() {
            config.driver.sources = self.sources.clone();
        }
    }
}

fn build_server(config: &Config, registry: Arc<dyn Registry>) -> camhub::Result<CameraServer> {
    let driver_config = &config.driver;
    let device_type = driver_config.kind.device_type();
    let device = keys::device_name(device_type, driver_config.index);
    let configuration = Configuration::new(registry.clone(), &device, config.server.persist_dir.clone());
    let ctx = DriverContext::new(registry, device_type, driver_config.index, configuration)
        .with_swap_chain_depth(config.server.swap_chain_depth)
        .with_watchdog(config.server.watchdog());

    let driver: Box<dyn CameraDriver> = match driver_config.kind {
        DriverKind::Pattern => Box::new(PatternDriver::new(
            ctx.clone(),
            driver_config.layout,
            driver_config.width,
            driver_config.height,
            driver_config.fps,
        )),
        DriverKind::Image => Box::new(ImageDriver::new(
            ctx.clone(),
            driver_config.sources.clone(),
            driver_config.fps,
        )),
    };
    Ok(CameraServer::new(driver, ctx, &config.server))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camhub=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    let device = keys::device_name(config.driver.kind.device_type(), config.driver.index);
    let registry: Arc<dyn Registry> = match &config.registry.host {
        Some(host) => {
            info!(
                "Launching camera server on device index {}, with key-value store on {}:{}...",
                config.driver.index, host, config.registry.port
            );
            Arc::new(RedisRegistry::connect(host, config.registry.port)?)
        }
        None => {
            info!(
                "Launching camera server on device index {}, with an in-process registry...",
                config.driver.index
            );
            Arc::new(MemoryRegistry::new())
        }
    };
    let supervisor = Supervisor::new(config.server.restart_delay());

    let signal_registry = registry.clone();
    let signal_supervisor = supervisor.clone();
    let command_channel = keys::command_channel(&device);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down {}", command_channel);
            signal_supervisor.stop();
            if let Err(e) = signal_registry.publish(&command_channel, Command::Shutdown.as_str()) {
                error!("Failed to publish shutdown: {}", e);
            }
        }
    });

    if args.monitor {
        let monitor_registry = registry.clone();
        let (device_type, index) = (config.driver.kind.device_type(), config.driver.index);
        let mut ticker = tokio::time::interval(config.server.status_interval());
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                match CameraClient::new(monitor_registry.clone(), device_type, index) {
                    Ok(client) => match client.frame_rate() {
                        Ok(fps) => info!("{} at {} fps", client.device_name(), fps),
                        Err(e) => warn!("Failed to read frame rate: {}", e),
                    },
                    Err(e) => info!("Waiting for camera: {}", e),
                }
            }
        });
    }

    let server_config = config.clone();
    let restarts = tokio::task::spawn_blocking(move || {
        supervisor.run_server(|| build_server(&server_config, registry.clone()))
    })
    .await?;

    info!("Camera server exited after {} restarts", restarts);
    Ok(())
}
