//! Camera server: registry lifecycle, command dispatch and status reporting
//! for one driver.

use std::fmt::{self, Display};
use std::ops::ControlFlow;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::configuration;
use crate::driver::{CameraDriver, DriverContext};
use crate::keys::{self, field, status};
use crate::picture::{epoch_millis, publish_geometry};
use crate::registry::Subscription;
use crate::{Error, Result, ServerConfig};

/// Control instruction accepted on `cameras/{Device}/command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Shutdown,
    Save,
    UpdateExposure,
    UpdateGain,
    UpdateWhiteBalance,
    AutoExposure,
    AutoGain,
    AutoWhiteBalance,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Shutdown,
        Command::Save,
        Command::UpdateExposure,
        Command::UpdateGain,
        Command::UpdateWhiteBalance,
        Command::AutoExposure,
        Command::AutoGain,
        Command::AutoWhiteBalance,
    ];

    /// Wire form of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Shutdown => "shutdown",
            Command::Save => "save",
            Command::UpdateExposure => "update_exposure",
            Command::UpdateGain => "update_gain",
            Command::UpdateWhiteBalance => "update_white_balance",
            Command::AutoExposure => "auto_exposure",
            Command::AutoGain => "auto_gain",
            Command::AutoWhiteBalance => "auto_white_balance",
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Command::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| Error::InvalidState(format!("unknown command '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Opening,
    Running,
    Closing,
    Closed,
}

/// Hosts one driver for the lifetime of one `launch`.
pub struct CameraServer {
    driver: Box<dyn CameraDriver>,
    ctx: DriverContext,
    poll_interval: Duration,
    status_interval: Duration,
    state: ServerState,
    registered: bool,
    pictures: Vec<String>,
}

impl CameraServer {
    pub fn new(driver: Box<dyn CameraDriver>, ctx: DriverContext, settings: &ServerConfig) -> Self {
        Self {
            driver,
            ctx,
            poll_interval: settings.poll_interval(),
            status_interval: settings.status_interval(),
            state: ServerState::Created,
            registered: false,
            pictures: Vec::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn device_name(&self) -> &str {
        self.ctx.device_name()
    }

    /// Open the driver, register the device and serve commands until `shutdown`
    /// or a fatal error. Registry state is cleaned up on every exit route.
    #[instrument(skip(self), fields(device = %self.ctx.device_name()))]
    pub fn launch(&mut self) -> Result<()> {
        if self.state != ServerState::Created {
            return Err(Error::InvalidState(format!(
                "launch of {} requested in state {:?}",
                self.ctx.device_name(),
                self.state
            )));
        }

        self.state = ServerState::Opening;
        let outcome = self.serve();
        if let Err(e) = &outcome {
            error!("Camera {} stopped: {}", self.ctx.device_name(), e);
        }
        self.shutdown_and_unregister();
        outcome
    }

    fn serve(&mut self) -> Result<()> {
        let device = self.ctx.device_name().to_owned();
        let registry = self.ctx.registry().clone();

        self.ctx.configuration().load_persisted()?;
        let mut commands = registry.subscribe(&keys::command_channel(&device))?;

        info!("Try to open the camera {}...", device);
        self.driver.open()?;
        info!("Camera {} opened.", device);

        registry.register(keys::DEVICES_SET, &device)?;
        self.registered = true;

        self.apply_configuration();
        self.register_pictures()?;

        self.state = ServerState::Running;
        info!("Camera {} is running.", device);
        self.run_loop(commands.as_mut())
    }

    fn run_loop(&mut self, commands: &mut dyn Subscription) -> Result<()> {
        let mut last_status = Instant::now();
        loop {
            if let Some(payload) = commands.poll(self.poll_interval)? {
                if self.handle_command(&payload).is_break() {
                    return Ok(());
                }
            }

            if last_status.elapsed() >= self.status_interval {
                last_status = Instant::now();
                self.publish_status();
                if !self.driver.is_alive() {
                    return Err(Error::DriverStalled {
                        device: self.ctx.device_name().to_owned(),
                        silent_ms: self.ctx.silent_for().as_millis() as u64,
                    });
                }
            }
        }
    }

    fn publish_status(&self) {
        let device = self.ctx.device_name();
        let fps = self.ctx.take_frame_count();
        self.ctx.publish_status(status::FPS, &fps.to_string());
        self.ctx
            .publish_status(status::HEARTBEAT, &epoch_millis().to_string());
        metrics::gauge!("camhub_fps", "device" => device.to_owned()).set(fps as f64);
        debug!("Camera {} delivered {} frames", device, fps);
    }

    /// Apply stored settings to a freshly opened driver. Missing entries are skipped.
    fn apply_configuration(&mut self) {
        info!("Try to configure camera...");
        let config = self.ctx.configuration().clone();
        let driver = &mut self.driver;

        if let Some(exposure) = config.get::<u32>(configuration::EXPOSURE) {
            if !driver.set_exposure(exposure) {
                error!("Failed to apply stored exposure {}.", exposure);
            }
        }
        if let Some(gain) = config.get::<f64>(configuration::GAIN) {
            if !driver.set_gain(gain) {
                error!("Failed to apply stored gain {}.", gain);
            }
        }
        if let Some(red) = config.get::<f64>(configuration::WHITE_BALANCE_RED) {
            if !driver.set_white_balance_red(red) {
                error!("Failed to apply stored white balance red channel {}.", red);
            }
        }
        if let Some(green) = config.get::<f64>(configuration::WHITE_BALANCE_GREEN) {
            if !driver.set_white_balance_green(green) {
                error!("Failed to apply stored white balance green channel {}.", green);
            }
        }
        if let Some(blue) = config.get::<f64>(configuration::WHITE_BALANCE_BLUE) {
            if !driver.set_white_balance_blue(blue) {
                error!("Failed to apply stored white balance blue channel {}.", blue);
            }
        }
        info!("Camera configured.");
    }

    fn register_pictures(&mut self) -> Result<()> {
        let device = self.ctx.device_name().to_owned();
        let registry = self.ctx.registry().clone();
        let pictures_set = keys::pictures_set(&device);

        for stream in self.driver.stream_descriptors()? {
            self.pictures.push(stream.name.clone());
            registry.register(&pictures_set, &stream.name)?;
            publish_geometry(registry.as_ref(), &device, &stream.name, &stream.header)?;
        }
        info!("Picture information registered.");
        Ok(())
    }

    /// Dispatch one command payload. `Break` ends the main loop.
    pub fn handle_command(&mut self, payload: &str) -> ControlFlow<()> {
        let command = match payload.parse::<Command>() {
            Ok(command) => command,
            Err(_) => {
                warn!("Unknown command '{}' received.", payload);
                return ControlFlow::Continue(());
            }
        };
        debug!("Command {} received", command);

        match command {
            Command::Shutdown => {
                info!("Shutdown command received.");
                self.driver.close();
                return ControlFlow::Break(());
            }
            Command::Save => match self.ctx.configuration().apply() {
                Ok(Some(path)) => info!("Configuration saved to {}.", path.display()),
                Ok(None) => warn!("No persist directory configured, configuration not saved."),
                Err(e) => error!("Failed to save configuration: {}", e),
            },
            Command::UpdateExposure => {
                self.update_entry::<u32, _>(configuration::EXPOSURE, "Exposure", |d, v| d.set_exposure(v))
            }
            Command::UpdateGain => {
                self.update_entry::<f64, _>(configuration::GAIN, "Gain", |d, v| d.set_gain(v))
            }
            Command::UpdateWhiteBalance => {
                self.update_entry::<f64, _>(
                    configuration::WHITE_BALANCE_RED,
                    "White balance red channel",
                    |d, v| d.set_white_balance_red(v),
                );
                self.update_entry::<f64, _>(
                    configuration::WHITE_BALANCE_GREEN,
                    "White balance green channel",
                    |d, v| d.set_white_balance_green(v),
                );
                self.update_entry::<f64, _>(
                    configuration::WHITE_BALANCE_BLUE,
                    "White balance blue channel",
                    |d, v| d.set_white_balance_blue(v),
                );
            }
            Command::AutoExposure => {
                if self.driver.auto_adjust_exposure() {
                    let exposure = self.driver.exposure();
                    self.persist(configuration::EXPOSURE, "Exposure", exposure);
                } else {
                    error!("Failed to auto adjust exposure.");
                }
            }
            Command::AutoGain => {
                if self.driver.auto_adjust_gain() {
                    let gain = self.driver.gain();
                    self.persist(configuration::GAIN, "Gain", gain);
                } else {
                    error!("Failed to auto adjust gain.");
                }
            }
            Command::AutoWhiteBalance => {
                if self.driver.auto_adjust_white_balance() {
                    let (red, green, blue) = (
                        self.driver.white_balance_red(),
                        self.driver.white_balance_green(),
                        self.driver.white_balance_blue(),
                    );
                    self.persist(configuration::WHITE_BALANCE_RED, "White balance red channel", red);
                    self.persist(configuration::WHITE_BALANCE_GREEN, "White balance green channel", green);
                    self.persist(configuration::WHITE_BALANCE_BLUE, "White balance blue channel", blue);
                } else {
                    error!("Failed to auto adjust white balance.");
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn update_entry<T, F>(&mut self, entry: &str, label: &str, apply: F)
    where
        T: FromStr + Display + Copy,
        F: FnOnce(&mut Box<dyn CameraDriver>, T) -> bool,
    {
        let Some(value) = self.ctx.configuration().get::<T>(entry) else {
            warn!(
                "{} is required to update, but its configuration value is missing.",
                label
            );
            return;
        };
        if apply(&mut self.driver, value) {
            info!("{} is updated to {}", label, value);
        } else {
            error!("Failed to update {} to {}.", label.to_lowercase(), value);
        }
    }

    fn persist<T: Display + Copy>(&self, entry: &str, label: &str, value: T) {
        match self.ctx.configuration().set(entry, value) {
            Ok(()) => info!("{} is auto adjusted to {}", label, value),
            Err(e) => error!("Failed to store auto adjusted {} {}: {}", entry, value, e),
        }
    }

    /// Release the driver and remove every registry trace of the device.
    fn shutdown_and_unregister(&mut self) {
        self.state = ServerState::Closing;
        let device = self.ctx.device_name().to_owned();
        let registry = self.ctx.registry().clone();

        if self.registered {
            if let Err(e) = registry.unregister(keys::DEVICES_SET, &device) {
                warn!("Failed to unregister {}: {}", device, e);
            }
            self.registered = false;
        }

        self.driver.close();
        info!("Camera closed.");

        for picture in self.pictures.drain(..) {
            for name in field::ALL {
                let key = keys::picture_field(&device, &picture, name);
                if let Err(e) = registry.delete_field(&key) {
                    warn!("Failed to delete {}: {}", key, e);
                }
            }
        }
        if let Err(e) = registry.delete_set(&keys::pictures_set(&device)) {
            warn!("Failed to delete picture set of {}: {}", device, e);
        }
        info!("Picture information unregistered.");
        self.state = ServerState::Closed;
    }

    /// Stop a server that is not inside `launch`. Safe to call more than once.
    pub fn close(&mut self) {
        match self.state {
            ServerState::Closed => {}
            ServerState::Created => {
                self.driver.close();
                self.state = ServerState::Closed;
            }
            _ => self.shutdown_and_unregister(),
        }
    }
}

impl Drop for CameraServer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_names() {
        for command in Command::ALL {
            assert_eq!(command.as_str().parse::<Command>().unwrap(), command);
        }
        assert!("Shutdown".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
        assert_eq!(Command::UpdateWhiteBalance.to_string(), "update_white_balance");
    }
}
