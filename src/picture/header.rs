//! Picture geometry and pixel format

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Numeric type of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    Unsigned,
    Signed,
    Float,
}

impl PixelType {
    fn suffix(self) -> char {
        match self {
            PixelType::Unsigned => 'U',
            PixelType::Signed => 'S',
            PixelType::Float => 'F',
        }
    }

    fn code(self) -> u32 {
        match self {
            PixelType::Unsigned => 0,
            PixelType::Signed => 1,
            PixelType::Float => 2,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PixelType::Unsigned),
            1 => Some(PixelType::Signed),
            2 => Some(PixelType::Float),
            _ => None,
        }
    }
}

/// Numeric type plus bits per sample, e.g. `8U` or `32F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelFormat {
    pub pixel_type: PixelType,
    pub bits: u32,
}

impl PixelFormat {
    pub const U8: PixelFormat = PixelFormat::new_unchecked(PixelType::Unsigned, 8);
    pub const F32: PixelFormat = PixelFormat::new_unchecked(PixelType::Float, 32);

    const fn new_unchecked(pixel_type: PixelType, bits: u32) -> Self {
        Self { pixel_type, bits }
    }

    /// Only the combinations a reader can map to a matrix type are accepted.
    pub fn new(pixel_type: PixelType, bits: u32) -> Result<Self> {
        let valid = matches!(
            (pixel_type, bits),
            (PixelType::Unsigned, 8 | 16)
                | (PixelType::Signed, 8 | 16 | 32)
                | (PixelType::Float, 16 | 32 | 64)
        );
        if valid {
            Ok(Self { pixel_type, bits })
        } else {
            Err(Error::InvalidFormat(format!(
                "{}{}",
                bits,
                pixel_type.suffix()
            )))
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.bits / 8) as usize
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.bits, self.pixel_type.suffix())
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(label: &str) -> Result<Self> {
        let invalid = || Error::InvalidFormat(label.to_owned());
        let suffix = label.chars().last().ok_or_else(invalid)?;
        let pixel_type = match suffix {
            'U' => PixelType::Unsigned,
            'S' => PixelType::Signed,
            'F' => PixelType::Float,
            _ => return Err(invalid()),
        };
        let bits = label[..label.len() - 1]
            .parse::<u32>()
            .map_err(|_| invalid())?;
        PixelFormat::new(pixel_type, bits)
    }
}

/// Geometry shared by every buffer of one swap chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PictureHeader {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub format: PixelFormat,
}

const REGION_MAGIC: u32 = u32::from_le_bytes(*b"CAMF");

impl PictureHeader {
    /// Bytes reserved in front of the payload of every region. Keeps 64-bit
    /// samples aligned.
    pub const ENCODED_LEN: usize = 64;

    pub fn new(width: u32, height: u32, channels: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            channels,
            format,
        }
    }

    /// Size of one row-major frame without the region header, `None` when
    /// the geometry does not fit in `usize`.
    pub fn payload_size(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.channels as usize)?
            .checked_mul(self.format.bytes_per_sample())
    }

    /// Size a region must have to hold this header plus one frame.
    pub fn region_size(&self) -> Option<usize> {
        self.payload_size()?.checked_add(Self::ENCODED_LEN)
    }

    pub fn encode(&self, mut out: &mut [u8]) -> Result<()> {
        if out.len() < Self::ENCODED_LEN {
            return Err(Error::InvalidState("region too small for header".into()));
        }
        out.put_u32_le(REGION_MAGIC);
        out.put_u32_le(self.format.pixel_type.code());
        out.put_u32_le(self.format.bits);
        out.put_u32_le(self.channels);
        out.put_u32_le(self.width);
        out.put_u32_le(self.height);
        Ok(())
    }

    /// Decode the header at the start of a region; `name` labels errors.
    pub fn decode(name: &str, mut region: &[u8]) -> Result<Self> {
        if region.len() < Self::ENCODED_LEN {
            return Err(Error::corrupt(name, "region shorter than its header"));
        }
        if region.get_u32_le() != REGION_MAGIC {
            return Err(Error::corrupt(name, "region header magic mismatch"));
        }
        let pixel_type = PixelType::from_code(region.get_u32_le())
            .ok_or_else(|| Error::corrupt(name, "unknown pixel type code"))?;
        let format = PixelFormat::new(pixel_type, region.get_u32_le())?;
        let channels = region.get_u32_le();
        let width = region.get_u32_le();
        let height = region.get_u32_le();
        Ok(Self::new(width, height, channels, format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_labels() {
        for label in ["8U", "8S", "16U", "16S", "16F", "32S", "32F", "64F"] {
            let format: PixelFormat = label.parse().unwrap();
            assert_eq!(format.to_string(), label);
        }
        assert!("32U".parse::<PixelFormat>().is_err());
        assert!("BGR".parse::<PixelFormat>().is_err());
        assert!("".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_payload_size() {
        let view = PictureHeader::new(640, 480, 3, PixelFormat::U8);
        assert_eq!(view.payload_size(), Some(640 * 480 * 3));

        let cloud = PictureHeader::new(640, 480, 4, PixelFormat::F32);
        assert_eq!(cloud.payload_size(), Some(640 * 480 * 4 * 4));
        assert_eq!(
            cloud.region_size(),
            Some(640 * 480 * 4 * 4 + PictureHeader::ENCODED_LEN)
        );
    }

    #[test]
    fn test_oversized_geometry_has_no_size() {
        let format: PixelFormat = "64F".parse().unwrap();
        let huge = PictureHeader::new(u32::MAX, u32::MAX, u32::MAX, format);
        assert_eq!(huge.payload_size(), None);
        assert_eq!(huge.region_size(), None);
    }

    #[test]
    fn test_header_survives_region() {
        let header = PictureHeader::new(1280, 720, 4, PixelFormat::F32);
        let mut region = vec![0u8; PictureHeader::ENCODED_LEN];
        header.encode(&mut region).unwrap();
        assert_eq!(PictureHeader::decode("test", &region).unwrap(), header);

        region[0] = 0;
        assert!(matches!(
            PictureHeader::decode("test", &region),
            Err(Error::CorruptState { .. })
        ));
    }
}
