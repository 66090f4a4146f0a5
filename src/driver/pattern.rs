//! Synthetic test-pattern camera
//!
//! Publishes a moving gradient on every view stream and, in the stereo layout,
//! a planar point cloud next to the left/right views. Exposure, gain and white
//! balance scale the rendered pixels so control round trips are visible to
//! readers.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::configuration;
use crate::picture::{PictureHeader, PictureWriter, PixelFormat};
use crate::{Error, Result};

use super::acquisition::Acquisition;
use super::{CameraDriver, DriverContext, StreamDescriptor};

/// Which streams the generator publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StreamLayout {
    /// One BGR view named `main`
    Mono,
    /// BGRA `left`/`right` views plus an XYZC `point_cloud`
    Stereo,
}

impl StreamLayout {
    pub fn streams(self, width: u32, height: u32) -> Vec<StreamDescriptor> {
        match self {
            StreamLayout::Mono => vec![StreamDescriptor::new(
                "main",
                PictureHeader::new(width, height, 3, PixelFormat::U8),
            )],
            StreamLayout::Stereo => vec![
                StreamDescriptor::new("left", PictureHeader::new(width, height, 4, PixelFormat::U8)),
                StreamDescriptor::new("right", PictureHeader::new(width, height, 4, PixelFormat::U8)),
                StreamDescriptor::new(
                    "point_cloud",
                    PictureHeader::new(width, height, 4, PixelFormat::F32),
                ),
            ],
        }
    }
}

const DEFAULT_EXPOSURE_US: u32 = 10_000;
const MAX_GAIN: f64 = 100.0;
const MAX_WHITE_BALANCE: f64 = 16.0;

#[derive(Debug, Clone, Copy)]
struct Controls {
    exposure: u32,
    gain: f64,
    /// Red, green, blue.
    white_balance: [f64; 3],
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            exposure: DEFAULT_EXPOSURE_US,
            gain: 0.0,
            white_balance: [1.0; 3],
        }
    }
}

impl Controls {
    fn brightness(&self) -> f64 {
        (self.exposure as f64 / DEFAULT_EXPOSURE_US as f64 * (1.0 + self.gain / 10.0)).clamp(0.0, 1.0)
    }

    /// White balance factor of one interleaved BGR(A) channel.
    fn channel_factor(&self, channel: usize) -> f64 {
        match channel {
            0 => self.white_balance[2],
            1 => self.white_balance[1],
            2 => self.white_balance[0],
            _ => 1.0,
        }
    }
}

pub struct PatternDriver {
    ctx: DriverContext,
    layout: StreamLayout,
    width: u32,
    height: u32,
    fps: f64,
    controls: Arc<Mutex<Controls>>,
    streams: Vec<StreamDescriptor>,
    acquisition: Option<Acquisition>,
}

impl PatternDriver {
    pub fn new(ctx: DriverContext, layout: StreamLayout, width: u32, height: u32, fps: f64) -> Self {
        Self {
            ctx,
            layout,
            width,
            height,
            fps,
            controls: Arc::new(Mutex::new(Controls::default())),
            streams: Vec::new(),
            acquisition: None,
        }
    }

    fn controls(&self) -> Controls {
        *self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, apply: impl FnOnce(&mut Controls)) {
        apply(&mut self.controls.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn white_balance_supported(&self) -> bool {
        self.layout == StreamLayout::Mono
    }

    fn set_white_balance_channel(&mut self, channel: usize, ratio: f64) -> bool {
        if !self.white_balance_supported() || !(ratio > 0.0 && ratio <= MAX_WHITE_BALANCE) {
            return false;
        }
        self.update(|c| c.white_balance[channel] = ratio);
        true
    }
}

impl CameraDriver for PatternDriver {
    #[instrument(skip(self), fields(device = %self.ctx.device_name()))]
    fn open(&mut self) -> Result<()> {
        if self.acquisition.is_some() {
            self.close();
        }
        let device = self.ctx.device_name().to_owned();
        if self.width == 0 || self.height == 0 {
            return Err(Error::DeviceUnavailable(device));
        }
        let fps = self
            .ctx
            .configuration()
            .get::<f64>(configuration::FPS)
            .unwrap_or(self.fps);
        if !(fps > 0.0 && fps.is_finite()) {
            return Err(Error::driver(device, format!("invalid acquisition rate {}", fps)));
        }

        let streams = self.layout.streams(self.width, self.height);
        let mut writers = streams
            .iter()
            .map(|s| self.ctx.open_writer(&s.name, s.header))
            .collect::<Result<Vec<_>>>()?;

        let flip = self.ctx.flip_requested();
        let ctx = self.ctx.clone();
        let controls = self.controls.clone();
        let stereo = self.layout == StreamLayout::Stereo;
        self.ctx.mark_alive();

        let acquisition = Acquisition::spawn(format!("{}-acquisition", device), fps, move |frame| {
            let controls = *controls.lock().unwrap_or_else(PoisonError::into_inner);
            for writer in &mut writers {
                let published = render(writer, frame, &controls, flip).and_then(|_| writer.publish());
                if let Err(e) = published {
                    error!("Failed to publish {} frame {}: {}", writer.picture(), frame, e);
                }
            }
            if stereo {
                let yaw = (frame as f64 * 0.01).sin();
                ctx.publish_status("orientation", &format!("0.000000,0.000000,{:.6}", yaw));
            }
            ctx.frame_captured();
        })?;

        info!(
            "Pattern camera {} opened: {} streams at {} fps",
            device,
            streams.len(),
            fps
        );
        self.streams = streams;
        self.acquisition = Some(acquisition);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut acquisition) = self.acquisition.take() {
            acquisition.stop();
            self.streams.clear();
            info!("Pattern camera {} closed", self.ctx.device_name());
        }
    }

    fn stream_descriptors(&self) -> Result<Vec<StreamDescriptor>> {
        if self.acquisition.is_none() {
            return Err(Error::InvalidState(format!(
                "{} is not open",
                self.ctx.device_name()
            )));
        }
        Ok(self.streams.clone())
    }

    fn is_alive(&self) -> bool {
        self.acquisition.is_some() && self.ctx.is_alive()
    }

    fn set_exposure(&mut self, microseconds: u32) -> bool {
        if microseconds == 0 {
            return false;
        }
        self.update(|c| c.exposure = microseconds);
        true
    }

    fn exposure(&self) -> u32 {
        self.controls().exposure
    }

    fn set_gain(&mut self, gain: f64) -> bool {
        if !(0.0..=MAX_GAIN).contains(&gain) {
            return false;
        }
        self.update(|c| c.gain = gain);
        true
    }

    fn gain(&self) -> f64 {
        self.controls().gain
    }

    fn set_white_balance_red(&mut self, ratio: f64) -> bool {
        self.set_white_balance_channel(0, ratio)
    }

    fn white_balance_red(&self) -> f64 {
        self.controls().white_balance[0]
    }

    fn set_white_balance_green(&mut self, ratio: f64) -> bool {
        self.set_white_balance_channel(1, ratio)
    }

    fn white_balance_green(&self) -> f64 {
        self.controls().white_balance[1]
    }

    fn set_white_balance_blue(&mut self, ratio: f64) -> bool {
        self.set_white_balance_channel(2, ratio)
    }

    fn white_balance_blue(&self) -> f64 {
        self.controls().white_balance[2]
    }

    fn auto_adjust_exposure(&mut self) -> bool {
        self.update(|c| c.exposure = DEFAULT_EXPOSURE_US);
        true
    }

    fn auto_adjust_gain(&mut self) -> bool {
        self.update(|c| c.gain = 0.0);
        true
    }

    fn auto_adjust_white_balance(&mut self) -> bool {
        if !self.white_balance_supported() {
            return false;
        }
        self.update(|c| c.white_balance = [1.0; 3]);
        true
    }
}

impl Drop for PatternDriver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Render frame `frame` into the ready buffer of `writer`.
fn render(writer: &mut PictureWriter, frame: u64, controls: &Controls, flip: bool) -> Result<()> {
    let header = *writer.header();
    let (width, height) = (header.width as usize, header.height as usize);
    let channels = header.channels as usize;
    let sample = header.format.bytes_per_sample();
    let stride = width * channels * sample;
    let payload = writer.frame_mut()?;

    for (row_index, row) in payload.chunks_exact_mut(stride).enumerate() {
        let y = if flip { height - 1 - row_index } else { row_index };
        if header.format == PixelFormat::F32 {
            point_cloud_row(row, y, width, height, frame);
        } else {
            gradient_row(row, y, channels, frame, controls);
        }
    }
    Ok(())
}

fn gradient_row(row: &mut [u8], y: usize, channels: usize, frame: u64, controls: &Controls) {
    let brightness = controls.brightness();
    for (x, pixel) in row.chunks_exact_mut(channels).enumerate() {
        let base = ((x + y) as u64 + frame) % 256;
        for (channel, value) in pixel.iter_mut().enumerate() {
            let scaled = base as f64 * brightness * controls.channel_factor(channel);
            *value = scaled.clamp(0.0, 255.0) as u8;
        }
    }
}

/// X, Y, Z in centimetres plus a confidence sample.
fn point_cloud_row(row: &mut [u8], y: usize, width: usize, height: usize, frame: u64) {
    let depth = 100.0 + 10.0 * (frame as f32 * 0.1).sin();
    for (x, point) in row.chunks_exact_mut(16).enumerate() {
        let values = [
            x as f32 - width as f32 / 2.0,
            y as f32 - height as f32 / 2.0,
            depth,
            1.0f32,
        ];
        for (slot, value) in point.chunks_exact_mut(4).zip(values) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Configuration;
    use crate::registry::{MemoryRegistry, Registry};

    fn driver(tag: &str, layout: StreamLayout) -> PatternDriver {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let device_type = format!("pattern-{}-{}", tag, std::process::id());
        let name = crate::keys::device_name(&device_type, 0);
        let configuration = Configuration::new(registry.clone(), &name, None);
        let ctx = DriverContext::new(registry, &device_type, 0, configuration).with_swap_chain_depth(3);
        PatternDriver::new(ctx, layout, 16, 8, 200.0)
    }

    #[test]
    fn test_descriptors_require_open() {
        let mut camera = driver("descriptors", StreamLayout::Stereo);
        assert!(camera.stream_descriptors().is_err());

        camera.open().unwrap();
        let streams = camera.stream_descriptors().unwrap();
        let labels: Vec<_> = streams
            .iter()
            .map(|s| (s.name.as_str(), s.format_label(), s.header.channels))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("left", "8U".to_string(), 4),
                ("right", "8U".to_string(), 4),
                ("point_cloud", "32F".to_string(), 4),
            ]
        );

        camera.close();
        camera.close();
        assert!(camera.stream_descriptors().is_err());
        assert!(!camera.is_alive());
    }

    #[test]
    fn test_reopen_after_close() {
        let mut camera = driver("reopen", StreamLayout::Mono);
        camera.open().unwrap();
        camera.close();
        camera.open().unwrap();
        assert!(camera.is_alive());
    }

    #[test]
    fn test_setter_rejections() {
        let mut mono = driver("mono-setters", StreamLayout::Mono);
        assert!(!mono.set_exposure(0));
        assert!(mono.set_exposure(2500));
        assert_eq!(mono.exposure(), 2500);
        assert!(!mono.set_gain(-1.0));
        assert!(mono.set_white_balance_red(1.2));
        assert!(!mono.set_white_balance_blue(0.0));
        assert!(mono.auto_adjust_white_balance());
        assert_eq!(mono.white_balance_red(), 1.0);

        let mut stereo = driver("stereo-setters", StreamLayout::Stereo);
        assert!(!stereo.set_white_balance_green(1.0));
        assert!(!stereo.auto_adjust_white_balance());
        assert!(stereo.auto_adjust_exposure());
    }
}
