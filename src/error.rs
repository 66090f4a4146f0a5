//! Error types shared by the transport and control planes

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The shared-memory primitive could not reserve a region.
    #[error("failed to allocate shared memory region '{name}' of {size} bytes: {reason}")]
    Allocation {
        name: String,
        size: usize,
        reason: String,
    },

    /// A picture stream is not currently published.
    #[error("picture '{picture}' is not provided by camera '{device}'")]
    StreamNotFound { device: String, picture: String },

    /// Stream metadata or a region disagrees with itself.
    #[error("corrupt state for '{name}': {reason}")]
    CorruptState { name: String, reason: String },

    /// No device is attached at the requested index.
    #[error("device '{0}' is unavailable")]
    DeviceUnavailable(String),

    #[error("device '{0}' is busy")]
    DeviceBusy(String),

    /// A vendor or backend call failed while opening or running the device.
    #[error("driver error on '{device}': {reason}")]
    Driver { device: String, reason: String },

    /// Discovery could not resolve a device name in the registry.
    #[error("camera '{0}' can not be found")]
    DeviceNotFound(String),

    /// The liveness watchdog saw no frame within its window.
    #[error("driver '{device}' delivered no frame for {silent_ms} ms")]
    DriverStalled { device: String, silent_ms: u64 },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("invalid pixel format '{0}'")]
    InvalidFormat(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn corrupt(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CorruptState {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn driver(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Driver {
            device: device.into(),
            reason: reason.into(),
        }
    }
}
