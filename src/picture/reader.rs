//! Consumer side of a picture stream

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::keys::{self, field};
use crate::registry::{get_parsed, Registry};
use crate::shm::AttachedRegion;
use crate::{Error, Result};

use super::{PictureHeader, PixelFormat};

/// Read-only view of the frame a reader last resolved.
///
/// The bytes alias shared memory the producer will overwrite once it wraps
/// around the chain; copy them out with [`PictureView::to_vec`] to keep them.
#[derive(Debug, Clone, Copy)]
pub struct PictureView<'a> {
    header: PictureHeader,
    chain_index: u32,
    data: &'a [u8],
}

impl<'a> PictureView<'a> {
    pub fn header(&self) -> &PictureHeader {
        &self.header
    }

    pub fn chain_index(&self) -> u32 {
        self.chain_index
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Row-major bytes of row `y`.
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        let stride = self.header.width as usize
            * self.header.channels as usize
            * self.header.format.bytes_per_sample();
        let start = (y as usize).checked_mul(stride)?;
        self.data.get(start..start.checked_add(stride)?)
    }
}

/// Attaches to an open stream and resolves its current frame.
pub struct PictureReader {
    registry: Arc<dyn Registry>,
    device: String,
    picture: String,
    header: PictureHeader,
    payload_len: usize,
    blocks: Vec<AttachedRegion>,
    id_key: String,
    timestamp_key: String,
}

impl PictureReader {
    /// Read the stream geometry from the registry and attach to every buffer.
    pub fn new(registry: Arc<dyn Registry>, device: &str, picture: &str) -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            registry
                .get_field(&keys::picture_field(device, picture, name))?
                .ok_or_else(|| Error::StreamNotFound {
                    device: device.to_owned(),
                    picture: picture.to_owned(),
                })
        };
        let number = |name: &str| -> Result<u32> {
            let raw = required(name)?;
            raw.trim().parse::<u32>().map_err(|_| {
                Error::corrupt(
                    keys::picture_field(device, picture, name),
                    format!("unparsable value '{}'", raw),
                )
            })
        };

        let width = number(field::WIDTH)?;
        let height = number(field::HEIGHT)?;
        let channels = number(field::CHANNELS)?;
        let format: PixelFormat = required(field::FORMAT)?.parse()?;
        let blocks_count = number(field::BLOCKS)?;
        if blocks_count == 0 {
            return Err(Error::corrupt(
                keys::picture_field(device, picture, field::BLOCKS),
                "swap chain has no blocks",
            ));
        }

        let header = PictureHeader::new(width, height, channels, format);
        let region_size = header.region_size().ok_or_else(|| {
            Error::corrupt(
                keys::picture_field(device, picture, field::WIDTH),
                format!(
                    "{}x{}x{} {} does not fit in the address space",
                    width, height, channels, format
                ),
            )
        })?;
        let blocks = (0..blocks_count)
            .map(|chain_index| {
                Self::attach_block(device, picture, chain_index, blocks_count, &header, region_size)
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "Reader attached to {}.{} ({} blocks)",
            device, picture, blocks_count
        );

        Ok(Self {
            id_key: keys::picture_field(device, picture, field::ID),
            timestamp_key: keys::picture_field(device, picture, field::TIMESTAMP),
            registry,
            device: device.to_owned(),
            picture: picture.to_owned(),
            header,
            payload_len: region_size - PictureHeader::ENCODED_LEN,
            blocks,
        })
    }

    fn attach_block(
        device: &str,
        picture: &str,
        chain_index: u32,
        blocks_count: u32,
        header: &PictureHeader,
        region_size: usize,
    ) -> Result<AttachedRegion> {
        let name = keys::region_name(device, picture, chain_index);
        let region = match AttachedRegion::attach(&name) {
            Ok(region) => region,
            // Single-buffered streams may still use the unindexed name.
            Err(_) if blocks_count == 1 => AttachedRegion::attach(&format!("{}.{}", device, picture))?,
            Err(e) => return Err(e),
        };

        if region.len() < region_size {
            return Err(Error::corrupt(
                region.name(),
                format!(
                    "region has {} bytes, {}x{}x{} {} needs {}",
                    region.len(),
                    header.width,
                    header.height,
                    header.channels,
                    header.format,
                    region_size
                ),
            ));
        }
        let stamped = PictureHeader::decode(region.name(), region.as_slice())?;
        if stamped != *header {
            return Err(Error::corrupt(
                region.name(),
                "region header disagrees with registry geometry",
            ));
        }
        Ok(region)
    }

    /// Attach a second, independent reader to the same buffers.
    pub fn try_clone(&self) -> Result<Self> {
        Self::new(self.registry.clone(), &self.device, &self.picture)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn picture(&self) -> &str {
        &self.picture
    }

    pub fn header(&self) -> &PictureHeader {
        &self.header
    }

    pub fn width(&self) -> u32 {
        self.header.width
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn channels(&self) -> u32 {
        self.header.channels
    }

    pub fn format(&self) -> PixelFormat {
        self.header.format
    }

    pub fn blocks_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// Resolve the most recently published buffer.
    pub fn read(&self) -> Result<PictureView<'_>> {
        let id: u32 = get_parsed(self.registry.as_ref(), &self.id_key)?
            .ok_or_else(|| Error::corrupt(&self.id_key, "no frame published"))?;
        let block = self.blocks.get(id as usize).ok_or_else(|| {
            Error::corrupt(
                &self.id_key,
                format!("index {} outside chain of {}", id, self.blocks.len()),
            )
        })?;

        let start = PictureHeader::ENCODED_LEN;
        let data = block
            .as_slice()
            .get(start..start + self.payload_len)
            .ok_or_else(|| Error::corrupt(block.name(), "region shrank below its frame size"))?;
        Ok(PictureView {
            header: self.header,
            chain_index: id,
            data,
        })
    }

    /// Milliseconds since the epoch of the last publish, 0 when none.
    pub fn read_timestamp_millis(&self) -> Result<u64> {
        Ok(get_parsed::<u64>(self.registry.as_ref(), &self.timestamp_key)?.unwrap_or(0))
    }

    pub fn read_timestamp(&self) -> Result<SystemTime> {
        Ok(UNIX_EPOCH + Duration::from_millis(self.read_timestamp_millis()?))
    }
}
