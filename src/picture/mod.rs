//! Shared-memory swap chains for picture streams
//!
//! A producer publishes a frame in three steps: pixel bytes go into the buffer
//! at the ready index, then the `id` key is set to that index, then the
//! `timestamp` key. Readers read `id` before touching a buffer. That order is
//! the only synchronization between the two sides.

pub mod buffer;
pub mod header;
pub mod reader;
pub mod writer;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::keys::{self, field};
use crate::registry::Registry;
use crate::Result;

pub use buffer::SwapChainBuffer;
pub use header::{PictureHeader, PixelFormat, PixelType};
pub use reader::{PictureReader, PictureView};
pub use writer::PictureWriter;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Write the geometry keys readers resolve a stream from.
pub fn publish_geometry(
    registry: &dyn Registry,
    device: &str,
    picture: &str,
    header: &PictureHeader,
) -> Result<()> {
    let entries = [
        (field::WIDTH, header.width.to_string()),
        (field::HEIGHT, header.height.to_string()),
        (field::CHANNELS, header.channels.to_string()),
        (field::FORMAT, header.format.to_string()),
    ];
    for (name, value) in entries {
        registry.set_field(&keys::picture_field(device, picture, name), &value)?;
    }
    Ok(())
}
