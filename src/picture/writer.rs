//! Producer side of a picture stream

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::keys::{self, field};
use crate::registry::Registry;
use crate::{Error, Result};

use super::{epoch_millis, PictureHeader, SwapChainBuffer};

/// Owns the swap chain of one stream and publishes completed frames.
///
/// Exactly one thread may drive a writer; the ready index is private to it.
pub struct PictureWriter {
    registry: Arc<dyn Registry>,
    device: String,
    picture: String,
    header: PictureHeader,
    buffers: Vec<SwapChainBuffer>,
    ready_index: u32,
    frame_pending: bool,
    id_key: String,
    timestamp_key: String,
}

impl PictureWriter {
    /// Allocate `blocks_count` buffers sized from `header` and publish the chain depth.
    #[instrument(skip(registry, header), fields(width = header.width, height = header.height))]
    pub fn open(
        registry: Arc<dyn Registry>,
        device: &str,
        picture: &str,
        header: PictureHeader,
        blocks_count: u32,
    ) -> Result<Self> {
        if blocks_count == 0 {
            return Err(Error::InvalidState(format!(
                "swap chain of '{}.{}' needs at least one block",
                device, picture
            )));
        }

        let buffers = (0..blocks_count)
            .map(|chain_index| SwapChainBuffer::create(device, picture, chain_index, header))
            .collect::<Result<Vec<_>>>()?;

        registry.set_field(
            &keys::picture_field(device, picture, field::BLOCKS),
            &blocks_count.to_string(),
        )?;
        info!(
            "Swap chain of {} blocks ready for {}.{} ({})",
            blocks_count, device, picture, header.format
        );

        Ok(Self {
            id_key: keys::picture_field(device, picture, field::ID),
            timestamp_key: keys::picture_field(device, picture, field::TIMESTAMP),
            registry,
            device: device.to_owned(),
            picture: picture.to_owned(),
            header,
            buffers,
            ready_index: 0,
            frame_pending: false,
        })
    }

    pub fn picture(&self) -> &str {
        &self.picture
    }

    pub fn header(&self) -> &PictureHeader {
        &self.header
    }

    pub fn blocks_count(&self) -> u32 {
        self.buffers.len() as u32
    }

    /// Index of the buffer the next frame goes into.
    pub fn ready_index(&self) -> u32 {
        self.ready_index
    }

    pub fn is_closed(&self) -> bool {
        self.buffers.is_empty()
    }

    fn ready_buffer(&mut self) -> Result<&mut SwapChainBuffer> {
        let index = self.ready_index as usize;
        self.buffers
            .get_mut(index)
            .ok_or_else(|| Error::InvalidState(format!("writer for '{}' is closed", self.picture)))
    }

    /// Copy a whole frame into the ready buffer.
    pub fn write_frame(&mut self, pixels: &[u8]) -> Result<()> {
        self.ready_buffer()?.write(pixels)?;
        self.frame_pending = true;
        Ok(())
    }

    /// Payload of the ready buffer, for producers that render in place.
    pub fn frame_mut(&mut self) -> Result<&mut [u8]> {
        let index = self.ready_index as usize;
        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or_else(|| Error::InvalidState(format!("writer for '{}' is closed", self.picture)))?;
        let payload = buffer.payload_mut()?;
        self.frame_pending = true;
        Ok(payload)
    }

    /// Publish the frame in the ready buffer, then advance to the next buffer.
    pub fn publish(&mut self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidState(format!(
                "writer for '{}' is closed",
                self.picture
            )));
        }
        if !self.frame_pending {
            return Err(Error::InvalidState(format!(
                "no frame written for '{}' since the last publish",
                self.picture
            )));
        }

        self.registry
            .set_field(&self.id_key, &self.ready_index.to_string())?;
        self.registry
            .set_field(&self.timestamp_key, &epoch_millis().to_string())?;
        metrics::counter!("camhub_frames_published_total", "picture" => self.picture.clone())
            .increment(1);

        self.frame_pending = false;
        self.ready_index = (self.ready_index + 1) % self.blocks_count();
        Ok(())
    }

    /// Release every buffer. Safe to call more than once.
    pub fn close(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        for buffer in &mut self.buffers {
            buffer.release();
        }
        self.buffers.clear();
        self.frame_pending = false;
        debug!("Swap chain of {}.{} released", self.device, self.picture);
    }
}

impl Drop for PictureWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::PixelFormat;
    use crate::registry::MemoryRegistry;

    fn device(tag: &str) -> String {
        format!("writer-{}-{}.0", tag, std::process::id())
    }

    #[test]
    fn test_publish_rotates_ready_index() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let device = device("rotate");
        let header = PictureHeader::new(4, 2, 1, PixelFormat::U8);
        let mut writer = PictureWriter::open(registry.clone(), &device, "main", header, 3).unwrap();

        assert_eq!(
            registry
                .get_field(&keys::picture_field(&device, "main", field::BLOCKS))
                .unwrap()
                .as_deref(),
            Some("3")
        );

        for expected in [0, 1, 2, 0, 1] {
            writer.write_frame(&[expected as u8; 8]).unwrap();
            writer.publish().unwrap();
            let id = registry
                .get_field(&keys::picture_field(&device, "main", field::ID))
                .unwrap();
            assert_eq!(id, Some(expected.to_string()));
        }
        assert!(registry
            .get_field(&keys::picture_field(&device, "main", field::TIMESTAMP))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_partial_frame_and_bare_publish_rejected() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let device = device("partial");
        let header = PictureHeader::new(4, 4, 3, PixelFormat::U8);
        let mut writer = PictureWriter::open(registry.clone(), &device, "main", header, 2).unwrap();

        assert!(writer.write_frame(&[0u8; 10]).is_err());
        assert!(writer.publish().is_err());
        assert!(registry
            .get_field(&keys::picture_field(&device, "main", field::ID))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_frame_mut_on_closed_writer_leaves_nothing_pending() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let header = PictureHeader::new(2, 2, 1, PixelFormat::U8);
        let mut writer = PictureWriter::open(registry, &device("closed"), "main", header, 2).unwrap();
        writer.close();

        assert!(writer.frame_mut().is_err());
        assert!(!writer.frame_pending);
    }

    #[test]
    fn test_zero_blocks_rejected() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let header = PictureHeader::new(1, 1, 1, PixelFormat::U8);
        assert!(PictureWriter::open(registry, &device("zero"), "main", header, 0).is_err());
    }
}
