//! Camera driver capability
//!
//! A driver owns the acquisition path of one device. It never sees the server:
//! everything it needs from the host (swap-chain writers, frame accounting,
//! configuration, status fields) comes through the [`DriverContext`] it is
//! built with.

pub mod acquisition;
pub mod image_loop;
pub mod pattern;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::configuration::{self, Configuration};
use crate::keys;
use crate::picture::{PictureHeader, PictureWriter};
use crate::registry::Registry;
use crate::Result;

pub use image_loop::ImageDriver;
pub use pattern::{PatternDriver, StreamLayout};

/// Which driver the launcher builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Synthetic test-pattern generator
    Pattern,
    /// Loops a set of image files
    Image,
}

impl DriverKind {
    /// Device type used in `{type}.{index}`.
    pub fn device_type(self) -> &'static str {
        match self {
            DriverKind::Pattern => "pattern",
            DriverKind::Image => "image",
        }
    }
}

/// One stream a driver publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub name: String,
    pub header: PictureHeader,
}

impl StreamDescriptor {
    pub fn new(name: &str, header: PictureHeader) -> Self {
        Self {
            name: name.to_owned(),
            header,
        }
    }

    /// Pixel format label, e.g. `8U`.
    pub fn format_label(&self) -> String {
        self.header.format.to_string()
    }
}

/// Hardware or virtual camera behind one server.
///
/// Setters report hardware rejection with `false`; only `open` may fail hard.
pub trait CameraDriver: Send {
    /// Acquire the device and start acquisition. Must work again after `close`.
    fn open(&mut self) -> Result<()>;

    /// Stop acquisition and release the device. Idempotent.
    fn close(&mut self);

    /// Streams this driver publishes. Only meaningful after `open`.
    fn stream_descriptors(&self) -> Result<Vec<StreamDescriptor>>;

    /// `false` once no frame arrived within the watchdog window.
    fn is_alive(&self) -> bool;

    /// Exposure time in microseconds.
    fn set_exposure(&mut self, microseconds: u32) -> bool;
    fn exposure(&self) -> u32;

    fn set_gain(&mut self, gain: f64) -> bool;
    fn gain(&self) -> f64;

    fn set_white_balance_red(&mut self, ratio: f64) -> bool;
    fn white_balance_red(&self) -> f64;
    fn set_white_balance_green(&mut self, ratio: f64) -> bool;
    fn white_balance_green(&self) -> f64;
    fn set_white_balance_blue(&mut self, ratio: f64) -> bool;
    fn white_balance_blue(&self) -> f64;

    /// One-shot auto adjustment; unsupported by default.
    fn auto_adjust_exposure(&mut self) -> bool {
        false
    }

    fn auto_adjust_gain(&mut self) -> bool {
        false
    }

    fn auto_adjust_white_balance(&mut self) -> bool {
        false
    }
}

static CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds on a process-wide monotonic clock.
fn monotonic_millis() -> u64 {
    CLOCK_BASE.elapsed().as_millis() as u64
}

/// Counters shared by the acquisition thread (sole writer) and the server.
#[derive(Default)]
struct FrameEvents {
    received: CachePadded<AtomicU64>,
    last_frame_ms: CachePadded<AtomicU64>,
}

/// Everything a driver may reach of its host.
#[derive(Clone)]
pub struct DriverContext {
    device_type: String,
    device_index: u32,
    device_name: String,
    registry: Arc<dyn Registry>,
    configuration: Configuration,
    swap_chain_depth: u32,
    watchdog: Duration,
    events: Arc<FrameEvents>,
}

impl DriverContext {
    pub fn new(
        registry: Arc<dyn Registry>,
        device_type: &str,
        device_index: u32,
        configuration: Configuration,
    ) -> Self {
        let device_name = keys::device_name(device_type, device_index);
        let events = FrameEvents::default();
        events
            .last_frame_ms
            .store(monotonic_millis(), Ordering::Relaxed);
        Self {
            device_type: device_type.to_owned(),
            device_index,
            device_name,
            registry,
            configuration,
            swap_chain_depth: 10,
            watchdog: Duration::from_secs(1),
            events: Arc::new(events),
        }
    }

    pub fn with_swap_chain_depth(mut self, depth: u32) -> Self {
        self.swap_chain_depth = depth;
        self
    }

    pub fn with_watchdog(mut self, window: Duration) -> Self {
        self.watchdog = window;
        self
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn swap_chain_depth(&self) -> u32 {
        self.swap_chain_depth
    }

    /// Open a writer for `picture` with the configured chain depth.
    pub fn open_writer(&self, picture: &str, header: PictureHeader) -> Result<PictureWriter> {
        PictureWriter::open(
            self.registry.clone(),
            &self.device_name,
            picture,
            header,
            self.swap_chain_depth,
        )
    }

    /// Whether the `Flip` configuration entry asks for vertically mirrored output.
    pub fn flip_requested(&self) -> bool {
        self.configuration.get::<bool>(configuration::FLIP).unwrap_or(false)
    }

    /// Restart the watchdog window, e.g. right after the device opens.
    pub fn mark_alive(&self) {
        self.events
            .last_frame_ms
            .store(monotonic_millis(), Ordering::Release);
    }

    /// Record one delivered frame. Called from the acquisition thread.
    pub fn frame_captured(&self) {
        self.events.received.fetch_add(1, Ordering::Relaxed);
        self.mark_alive();
    }

    /// Frames received since the previous call.
    pub fn take_frame_count(&self) -> u64 {
        self.events.received.swap(0, Ordering::Relaxed)
    }

    /// Time since the last delivered frame.
    pub fn silent_for(&self) -> Duration {
        let last = self.events.last_frame_ms.load(Ordering::Acquire);
        Duration::from_millis(monotonic_millis().saturating_sub(last))
    }

    pub fn watchdog(&self) -> Duration {
        self.watchdog
    }

    pub fn is_alive(&self) -> bool {
        self.silent_for() <= self.watchdog
    }

    /// Write `cameras/{device}/status/{name}`.
    pub fn publish_status(&self, name: &str, value: &str) {
        let key = keys::status_field(&self.device_name, name);
        if let Err(e) = self.registry.set_field(&key, value) {
            warn!("Failed to publish status {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn context() -> DriverContext {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let configuration = Configuration::new(registry.clone(), "ctx.0", None);
        DriverContext::new(registry, "ctx", 0, configuration)
    }

    #[test]
    fn test_frame_count_resets_on_take() {
        let ctx = context();
        for _ in 0..5 {
            ctx.frame_captured();
        }
        assert_eq!(ctx.take_frame_count(), 5);
        assert_eq!(ctx.take_frame_count(), 0);
    }

    #[test]
    fn test_watchdog_expires_without_frames() {
        let ctx = context().with_watchdog(Duration::from_millis(20));
        assert!(ctx.is_alive());
        std::thread::sleep(Duration::from_millis(60));
        assert!(!ctx.is_alive());
        ctx.frame_captured();
        assert!(ctx.is_alive());
    }

    #[test]
    fn test_flip_and_status() {
        let ctx = context();
        assert!(!ctx.flip_requested());
        ctx.configuration().set(configuration::FLIP, true).unwrap();
        assert!(ctx.flip_requested());

        ctx.publish_status("orientation", "0,0,1");
        assert_eq!(
            ctx.registry()
                .get_field("cameras/ctx.0/status/orientation")
                .unwrap()
                .as_deref(),
            Some("0,0,1")
        );
    }
}
