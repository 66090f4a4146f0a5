//! File-loop camera replaying a fixed set of images
//!
//! Every source is decoded once at open, converted to interleaved BGR and then
//! replayed in order on the `main` stream, wrapping around forever. The device
//! has no controls: every setter reports rejection.

use std::path::PathBuf;

use tracing::{error, info, instrument};

use crate::configuration;
use crate::picture::{PictureHeader, PixelFormat};
use crate::{Error, Result};

use super::acquisition::Acquisition;
use super::{CameraDriver, DriverContext, StreamDescriptor};

const STREAM: &str = "main";

pub struct ImageDriver {
    ctx: DriverContext,
    sources: Vec<PathBuf>,
    fps: f64,
    streams: Vec<StreamDescriptor>,
    acquisition: Option<Acquisition>,
}

impl ImageDriver {
    pub fn new(ctx: DriverContext, sources: Vec<PathBuf>, fps: f64) -> Self {
        Self {
            ctx,
            sources,
            fps,
            streams: Vec::new(),
            acquisition: None,
        }
    }

    /// Decode every source into BGR frames of one common size.
    fn load_frames(&self, flip: bool) -> Result<(u32, u32, Vec<Vec<u8>>)> {
        let device = self.ctx.device_name();
        let mut dimensions = None;
        let mut frames = Vec::with_capacity(self.sources.len());

        for path in &self.sources {
            let mut rgb = image::open(path)?.to_rgb8();
            if flip {
                rgb = image::imageops::flip_vertical(&rgb);
            }
            let size = rgb.dimensions();
            match dimensions {
                None => dimensions = Some(size),
                Some(expected) if expected != size => {
                    return Err(Error::driver(
                        device,
                        format!(
                            "{} is {}x{}, previous sources are {}x{}",
                            path.display(),
                            size.0,
                            size.1,
                            expected.0,
                            expected.1
                        ),
                    ));
                }
                Some(_) => {}
            }

            let mut bgr = rgb.into_raw();
            for pixel in bgr.chunks_exact_mut(3) {
                pixel.swap(0, 2);
            }
            frames.push(bgr);
        }

        let (width, height) = dimensions.ok_or_else(|| Error::DeviceUnavailable(device.to_owned()))?;
        Ok((width, height, frames))
    }
}

impl CameraDriver for ImageDriver {
    #[instrument(skip(self), fields(device = %self.ctx.device_name()))]
    fn open(&mut self) -> Result<()> {
        if self.acquisition.is_some() {
            self.close();
        }
        let device = self.ctx.device_name().to_owned();
        if self.sources.is_empty() {
            return Err(Error::DeviceUnavailable(device));
        }
        let fps = self
            .ctx
            .configuration()
            .get::<f64>(configuration::FPS)
            .unwrap_or(self.fps);
        if !(fps > 0.0 && fps.is_finite()) {
            return Err(Error::driver(device, format!("invalid playback rate {}", fps)));
        }

        let (width, height, frames) = self.load_frames(self.ctx.flip_requested())?;
        let stream = StreamDescriptor::new(STREAM, PictureHeader::new(width, height, 3, PixelFormat::U8));
        let mut writer = self.ctx.open_writer(&stream.name, stream.header)?;
        let ctx = self.ctx.clone();
        self.ctx.mark_alive();

        let count = frames.len();
        let acquisition = Acquisition::spawn(format!("{}-playback", device), fps, move |tick| {
            let frame = &frames[(tick % count as u64) as usize];
            match writer.write_frame(frame).and_then(|_| writer.publish()) {
                Ok(()) => ctx.frame_captured(),
                Err(e) => error!("Failed to publish frame {}: {}", tick, e),
            }
        })?;

        info!(
            "Image camera {} opened: {} sources of {}x{} at {} fps",
            device, count, width, height, fps
        );
        self.streams = vec![stream];
        self.acquisition = Some(acquisition);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut acquisition) = self.acquisition.take() {
            acquisition.stop();
            self.streams.clear();
            info!("Image camera {} closed", self.ctx.device_name());
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

    fn set_exposure(&mut self, _microseconds: u32) -> bool {
        false
    }

    fn exposure(&self) -> u32 {
        0
    }

    fn set_gain(&mut self, _gain: f64) -> bool {
        false
    }

    fn gain(&self) -> f64 {
        0.0
    }

    fn set_white_balance_red(&mut self, _ratio: f64) -> bool {
        false
    }

    fn white_balance_red(&self) -> f64 {
        0.0
    }

    fn set_white_balance_green(&mut self, _ratio: f64) -> bool {
        false
    }

    fn white_balance_green(&self) -> f64 {
        0.0
    }

    fn set_white_balance_blue(&mut self, _ratio: f64) -> bool {
        false
    }

    fn white_balance_blue(&self) -> f64 {
        0.0
    }
}

impl Drop for ImageDriver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::configuration::Configuration;
    use crate::picture::PictureReader;
    use crate::registry::{MemoryRegistry, Registry};

    fn driver(tag: &str, sources: Vec<PathBuf>) -> (Arc<dyn Registry>, ImageDriver) {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let device_type = format!("image-{}-{}", tag, std::process::id());
        let name = crate::keys::device_name(&device_type, 0);
        let configuration = Configuration::new(registry.clone(), &name, None);
        let ctx = DriverContext::new(registry.clone(), &device_type, 0, configuration)
            .with_swap_chain_depth(2);
        (registry, ImageDriver::new(ctx, sources, 100.0))
    }

    #[test]
    fn test_no_sources_is_unavailable() {
        let (_, mut camera) = driver("empty", Vec::new());
        assert!(matches!(camera.open(), Err(Error::DeviceUnavailable(_))));
        assert!(!camera.set_exposure(100));
        assert!(!camera.auto_adjust_gain());
    }

    #[test]
    fn test_replays_source_as_bgr() {
        let path = std::env::temp_dir().join(format!("camhub-image-{}.png", std::process::id()));
        RgbImage::from_pixel(4, 2, Rgb([10, 20, 30])).save(&path).unwrap();

        let (registry, mut camera) = driver("replay", vec![path.clone()]);
        camera.open().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let reader = PictureReader::new(registry, camera.ctx.device_name(), STREAM).unwrap();
        assert_eq!((reader.width(), reader.height(), reader.channels()), (4, 2, 3));
        let view = reader.read().unwrap();
        assert_eq!(&view.bytes()[..3], &[30, 20, 10]);

        camera.close();
        let _ = std::fs::remove_file(path);
    }
}
