pub mod client;
pub mod configuration;
pub mod driver;
pub mod error;
pub mod keys;
pub mod picture;
pub mod registry;
pub mod server;
pub mod shm;
pub mod supervisor;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use client::CameraClient;
pub use error::{Error, Result};
pub use server::{CameraServer, Command, ServerState};
pub use supervisor::Supervisor;

use driver::{DriverKind, StreamLayout};

/// Launcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub server: ServerConfig,
    pub driver: DriverConfig,
}

/// Endpoint of the external key-value store.
///
/// Without a host the launcher serves from an in-process registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub host: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub poll_interval_ms: u64,
    pub status_interval_ms: u64,
    pub watchdog_ms: u64,
    pub swap_chain_depth: u32,
    pub restart_delay_ms: u64,
    /// Directory `save` writes `{Device}.json` into, `None` disables saving.
    pub persist_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub kind: DriverKind,
    pub index: u32,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub layout: StreamLayout,
    /// Image files replayed by the image driver
    pub sources: Vec<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 6379,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            status_interval_ms: 1000,
            watchdog_ms: 1000,
            swap_chain_depth: 10,
            restart_delay_ms: 1000,
            persist_dir: Some(PathBuf::from("configurations")),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::Pattern,
            index: 0,
            fps: 30.0,
            width: 640,
            height: 480,
            layout: StreamLayout::Mono,
            sources: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `CAMHUB__SECTION__KEY` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let loaded = builder
            .add_source(
                config::Environment::with_prefix("CAMHUB")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(loaded.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("camhub-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[server]\nswap_chain_depth = 4\n\n[driver]\nkind = \"image\"\nlayout = \"stereo\"\n",
        )
        .unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.server.swap_chain_depth, 4);
        assert_eq!(config.server.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.driver.kind, DriverKind::Image);
        assert_eq!(config.driver.layout, StreamLayout::Stereo);
        assert_eq!(config.registry.port, 6379);
        assert_eq!(config.registry.host, None);
        assert_eq!(
            config.server.persist_dir.as_deref(),
            Some(Path::new("configurations"))
        );

        let _ = std::fs::remove_file(path);
    }
}
