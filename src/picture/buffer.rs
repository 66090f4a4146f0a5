//! One region of a swap chain

use crate::keys;
use crate::shm::OwnedRegion;
use crate::{Error, Result};

use super::PictureHeader;

/// Producer-owned region holding the header and one frame of one stream.
pub struct SwapChainBuffer {
    region: OwnedRegion,
    payload_len: usize,
    chain_index: u32,
}

impl SwapChainBuffer {
    /// Allocate `{device}.{picture}.{chain_index}` and stamp the header into it.
    pub fn create(
        device: &str,
        picture: &str,
        chain_index: u32,
        header: PictureHeader,
    ) -> Result<Self> {
        let name = keys::region_name(device, picture, chain_index);
        let (Some(payload_len), Some(region_size)) = (header.payload_size(), header.region_size())
        else {
            return Err(Error::Allocation {
                name,
                size: usize::MAX,
                reason: format!(
                    "{}x{}x{} {} does not fit in the address space",
                    header.width, header.height, header.channels, header.format
                ),
            });
        };
        let mut region = OwnedRegion::create(&name, region_size)?;
        header.encode(region.as_mut_slice()?)?;
        Ok(Self {
            region,
            payload_len,
            chain_index,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn chain_index(&self) -> u32 {
        self.chain_index
    }

    /// Mutable payload area, exactly one frame long.
    pub fn payload_mut(&mut self) -> Result<&mut [u8]> {
        let size = self.payload_len;
        let region = self.region.as_mut_slice()?;
        region
            .get_mut(PictureHeader::ENCODED_LEN..PictureHeader::ENCODED_LEN + size)
            .ok_or_else(|| Error::InvalidState("region smaller than its header claims".into()))
    }

    /// Copy a complete frame in. Partial frames are rejected before any byte is written.
    pub fn write(&mut self, pixels: &[u8]) -> Result<()> {
        let expected = self.payload_len;
        if pixels.len() != expected {
            return Err(Error::InvalidState(format!(
                "frame for '{}' has {} bytes, geometry needs {}",
                self.name(),
                pixels.len(),
                expected
            )));
        }
        self.payload_mut()?.copy_from_slice(pixels);
        Ok(())
    }

    pub fn release(&mut self) {
        self.region.release();
    }
}
