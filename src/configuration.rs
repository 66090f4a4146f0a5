//! Per-device configuration namespace (`configurations/{Device}/...`)

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::keys;
use crate::registry::Registry;
use crate::Result;

pub const EXPOSURE: &str = "Exposure";
pub const GAIN: &str = "Gain";
pub const WHITE_BALANCE_RED: &str = "WhiteBalanceRed";
pub const WHITE_BALANCE_GREEN: &str = "WhiteBalanceGreen";
pub const WHITE_BALANCE_BLUE: &str = "WhiteBalanceBlue";
pub const FPS: &str = "FPS";
pub const FLIP: &str = "Flip";

/// Typed access to one device's settings, with optional file persistence.
#[derive(Clone)]
pub struct Configuration {
    registry: Arc<dyn Registry>,
    device: String,
    prefix: String,
    persist_dir: Option<PathBuf>,
}

impl Configuration {
    pub fn new(registry: Arc<dyn Registry>, device: &str, persist_dir: Option<PathBuf>) -> Self {
        Self {
            registry,
            device: device.to_owned(),
            prefix: keys::configuration_prefix(device),
            persist_dir,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Value of `name`, or `None` when it is missing or does not parse.
    pub fn get<T: FromStr>(&self, name: &str) -> Option<T> {
        let key = keys::configuration_entry(&self.device, name);
        match self.registry.get_field(&key) {
            Ok(Some(raw)) => match raw.trim().parse::<T>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Configuration {} holds unparsable value '{}'.", key, raw);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read configuration {}: {}", key, e);
                None
            }
        }
    }

    pub fn set<T: Display>(&self, name: &str, value: T) -> Result<()> {
        self.registry.set_field(
            &keys::configuration_entry(&self.device, name),
            &value.to_string(),
        )
    }

    /// Every entry of the namespace, keyed by entry name.
    pub fn entries(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .registry
            .scan_fields(&self.prefix)?
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&self.prefix)
                    .map(|name| (name.to_owned(), value))
            })
            .collect())
    }

    fn persist_path(&self) -> Option<PathBuf> {
        self.persist_dir
            .as_deref()
            .map(|dir| dir.join(format!("{}.json", self.device)))
    }

    /// Write the namespace to `{persist_dir}/{device}.json`.
    ///
    /// Returns the written path, or `None` when no persist directory is configured.
    pub fn apply(&self) -> Result<Option<PathBuf>> {
        let Some(path) = self.persist_path() else {
            return Ok(None);
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let entries = self.entries()?;
        fs::write(&path, serde_json::to_vec_pretty(&entries)?)?;
        info!("Configuration of {} persisted to {}", self.device, path.display());
        Ok(Some(path))
    }

    /// Seed the registry from the persisted file. Entries already present win.
    pub fn load_persisted(&self) -> Result<usize> {
        let Some(path) = self.persist_path() else {
            return Ok(0);
        };
        if !Path::new(&path).exists() {
            debug!("No persisted configuration at {}", path.display());
            return Ok(0);
        }

        let entries: BTreeMap<String, String> = serde_json::from_slice(&fs::read(&path)?)?;
        let mut loaded = 0;
        for (name, value) in entries {
            let key = keys::configuration_entry(&self.device, &name);
            if self.registry.get_field(&key)?.is_none() {
                self.registry.set_field(&key, &value)?;
                loaded += 1;
            }
        }
        info!("Loaded {} persisted configuration entries for {}", loaded, self.device);
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("camhub-config-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn test_typed_get_and_set() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let config = Configuration::new(registry.clone(), "cfg.0", None);

        assert_eq!(config.get::<u32>(EXPOSURE), None);
        config.set(EXPOSURE, 5000u32).unwrap();
        config.set(GAIN, 1.5f64).unwrap();
        assert_eq!(config.get::<u32>(EXPOSURE), Some(5000));
        assert_eq!(config.get::<f64>(GAIN), Some(1.5));
        assert_eq!(
            registry.get_field("configurations/cfg.0/Exposure").unwrap().as_deref(),
            Some("5000")
        );

        registry.set_field("configurations/cfg.0/Gain", "loud").unwrap();
        assert_eq!(config.get::<f64>(GAIN), None);
    }

    #[test]
    fn test_apply_then_load_persisted() {
        let dir = scratch_dir("persist");
        let first: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let config = Configuration::new(first, "cfg.1", Some(dir.clone()));
        config.set(EXPOSURE, 800u32).unwrap();
        config.set(GAIN, 3u32).unwrap();
        let path = config.apply().unwrap().unwrap();
        assert!(path.exists());

        let second: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        second.set_field("configurations/cfg.1/Gain", "7").unwrap();
        let restored = Configuration::new(second, "cfg.1", Some(dir.clone()));
        assert_eq!(restored.load_persisted().unwrap(), 1);
        assert_eq!(restored.get::<u32>(EXPOSURE), Some(800));
        assert_eq!(restored.get::<u32>(GAIN), Some(7));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_apply_without_directory_is_noop() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let config = Configuration::new(registry, "cfg.2", None);
        assert_eq!(config.apply().unwrap(), None);
        assert_eq!(config.load_persisted().unwrap(), 0);
    }
}
