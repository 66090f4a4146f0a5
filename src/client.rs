//! Consumer-side discovery and remote control of one device

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::configuration::{self, Configuration};
use crate::keys::{self, status};
use crate::picture::PictureReader;
use crate::registry::{get_parsed, Registry};
use crate::server::Command;
use crate::{Error, Result};

/// Resolves a device and hands out readers for its streams.
///
/// Control setters are fire-and-forget: they write the configuration entry and
/// publish the matching command without waiting for the server.
pub struct CameraClient {
    registry: Arc<dyn Registry>,
    device: String,
    command_channel: String,
    configuration: Configuration,
}

impl CameraClient {
    /// Resolve `{device_type}.{index}`, or any registered device when
    /// `device_type` is the wildcard `*`.
    pub fn new(registry: Arc<dyn Registry>, device_type: &str, index: u32) -> Result<Self> {
        let device = if device_type == keys::WILDCARD {
            registry
                .random_member(keys::DEVICES_SET)?
                .ok_or_else(|| Error::DeviceNotFound(keys::WILDCARD.to_owned()))?
        } else {
            keys::device_name(device_type, index)
        };
        if !registry.is_registered(keys::DEVICES_SET, &device)? {
            return Err(Error::DeviceNotFound(device));
        }
        debug!("Client resolved camera {}", device);

        Ok(Self {
            command_channel: keys::command_channel(&device),
            configuration: Configuration::new(registry.clone(), &device, None),
            registry,
            device,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    /// Names of the streams the device currently publishes.
    pub fn list_streams(&self) -> Result<HashSet<String>> {
        self.registry.list_members(&keys::pictures_set(&self.device))
    }

    /// Reader for `picture`, or for any published stream when it is `*`.
    pub fn get_reader(&self, picture: &str) -> Result<PictureReader> {
        let pictures = keys::pictures_set(&self.device);
        let not_found = |picture: &str| Error::StreamNotFound {
            device: self.device.clone(),
            picture: picture.to_owned(),
        };

        let picture = if picture == keys::WILDCARD {
            self.registry
                .random_member(&pictures)?
                .ok_or_else(|| not_found(picture))?
        } else {
            picture.to_owned()
        };
        if !self.registry.is_registered(&pictures, &picture)? {
            return Err(not_found(&picture));
        }
        PictureReader::new(self.registry.clone(), &self.device, &picture)
    }

    /// Last frames-per-second value the server reported, 0 when none.
    pub fn frame_rate(&self) -> Result<u32> {
        let key = keys::status_field(&self.device, status::FPS);
        Ok(get_parsed(self.registry.as_ref(), &key)?.unwrap_or(0))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.registry.publish(&self.command_channel, command.as_str())?;
        info!("Sent {} to {}", command, self.device);
        Ok(())
    }

    /// Exposure time in microseconds.
    pub fn set_exposure(&self, microseconds: u32) -> Result<()> {
        self.configuration.set(configuration::EXPOSURE, microseconds)?;
        self.send(Command::UpdateExposure)
    }

    pub fn set_gain(&self, gain: f64) -> Result<()> {
        self.configuration.set(configuration::GAIN, gain)?;
        self.send(Command::UpdateGain)
    }

    pub fn set_white_balance(&self, red: f64, green: f64, blue: f64) -> Result<()> {
        self.configuration.set(configuration::WHITE_BALANCE_RED, red)?;
        self.configuration.set(configuration::WHITE_BALANCE_GREEN, green)?;
        self.configuration.set(configuration::WHITE_BALANCE_BLUE, blue)?;
        self.send(Command::UpdateWhiteBalance)
    }

    pub fn auto_adjust_exposure(&self) -> Result<()> {
        self.send(Command::AutoExposure)
    }

    pub fn auto_adjust_gain(&self) -> Result<()> {
        self.send(Command::AutoGain)
    }

    pub fn auto_adjust_white_balance(&self) -> Result<()> {
        self.send(Command::AutoWhiteBalance)
    }

    /// Ask the server to persist its configuration namespace.
    pub fn save_configuration(&self) -> Result<()> {
        self.send(Command::Save)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    #[test]
    fn test_unknown_device_rejected() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        assert!(matches!(
            CameraClient::new(registry.clone(), "daheng", 0),
            Err(Error::DeviceNotFound(name)) if name == "daheng.0"
        ));
        assert!(matches!(
            CameraClient::new(registry, keys::WILDCARD, 0),
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_frame_rate_defaults_to_zero() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        registry.register(keys::DEVICES_SET, "zed.1").unwrap();
        let client = CameraClient::new(registry.clone(), "zed", 1).unwrap();
        assert_eq!(client.frame_rate().unwrap(), 0);

        registry.set_field("cameras/zed.1/status/fps", "59").unwrap();
        assert_eq!(client.frame_rate().unwrap(), 59);
    }

    #[test]
    fn test_gain_setter_writes_then_publishes() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        registry.register(keys::DEVICES_SET, "hik.2").unwrap();
        let mut commands = registry.subscribe("cameras/hik.2/command").unwrap();
        let client = CameraClient::new(registry.clone(), "hik", 2).unwrap();

        client.set_gain(2.5).unwrap();
        assert_eq!(
            registry.get_field("configurations/hik.2/Gain").unwrap().as_deref(),
            Some("2.5")
        );
        let received = commands
            .poll(std::time::Duration::from_millis(100))
            .unwrap();
        assert_eq!(received.as_deref(), Some("update_gain"));
    }
}
