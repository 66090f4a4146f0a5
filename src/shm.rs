//! Named shared-memory regions
//!
//! Regions are POSIX shared-memory objects (`shm_open`) mapped with `memmap2`.
//! The producer owns a region (`OwnedRegion`) and unlinks it on release;
//! consumers attach read-only (`AttachedRegion`) and never unlink.

use std::fs::File;

use memmap2::{Mmap, MmapMut};
use nix::errno::Errno;
use nix::fcntl::{posix_fallocate, OFlag};
use nix::libc::off_t;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tracing::{debug, warn};

use crate::{Error, Result};

/// POSIX object path for a region name.
fn object_path(name: &str) -> String {
    format!("/{}", name)
}

/// Round `size` up to a whole number of pages, `None` on overflow.
pub fn page_aligned(size: usize) -> Option<usize> {
    let page = page_size::get();
    size.max(1).checked_next_multiple_of(page)
}

/// Writable region owned by the producer.
pub struct OwnedRegion {
    name: String,
    map: Option<MmapMut>,
}

impl OwnedRegion {
    /// Create (or reclaim after a crash) the region `name` with at least `size` bytes.
    ///
    /// Pages are reserved up front, so a region larger than the backing
    /// store fails here with [`Error::Allocation`] instead of faulting on
    /// first write.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let requested = size;
        let allocation_error = |size: usize, reason: String| Error::Allocation {
            name: name.to_owned(),
            size,
            reason,
        };
        let size = page_aligned(requested)
            .ok_or_else(|| allocation_error(requested, "size overflows page alignment".into()))?;
        let length = off_t::try_from(size)
            .map_err(|_| allocation_error(size, "size exceeds the file offset range".into()))?;
        let allocation_error = |reason: String| allocation_error(size, reason);

        let fd = shm_open(
            object_path(name).as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_TRUNC,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        )
        .map_err(|e| allocation_error(e.to_string()))?;
        let file = File::from(fd);
        let reserved = file
            .set_len(size as u64)
            .map_err(|e| e.to_string())
            .and_then(|_| {
                posix_fallocate(&file, 0, length).map_err(|errno| match errno {
                    Errno::ENOSPC => "not enough shared memory available".to_owned(),
                    Errno::EFBIG => "region exceeds the maximum object size".to_owned(),
                    other => other.to_string(),
                })
            });
        if let Err(reason) = reserved {
            // Drop the half-made object.
            let _ = shm_unlink(object_path(name).as_str());
            return Err(allocation_error(reason));
        }

        // SAFETY: the object was just created and sized; only this process writes it.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| allocation_error(e.to_string()))?;
        debug!(region = name, size, "shared region created");

        Ok(Self {
            name: name.to_owned(),
            map: Some(map),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_released(&self) -> bool {
        self.map.is_none()
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        self.map
            .as_deref_mut()
            .ok_or_else(|| Error::InvalidState(format!("region '{}' is released", self.name)))
    }

    /// Unmap and unlink the region. Calling it again is a no-op.
    pub fn release(&mut self) {
        if self.map.take().is_none() {
            return;
        }
        if let Err(e) = shm_unlink(object_path(&self.name).as_str()) {
            warn!(region = %self.name, "failed to unlink shared region: {}", e);
        } else {
            debug!(region = %self.name, "shared region released");
        }
    }
}

impl Drop for OwnedRegion {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read-only, non-owning attachment to an existing region.
pub struct AttachedRegion {
    name: String,
    map: Mmap,
}

impl AttachedRegion {
    pub fn attach(name: &str) -> Result<Self> {
        let fd = shm_open(object_path(name).as_str(), OFlag::O_RDONLY, Mode::empty())
            .map_err(|e| Error::corrupt(name, format!("can not attach shared region: {}", e)))?;
        let file = File::from(fd);

        // SAFETY: mapped read-only; the producer may keep writing, readers copy out.
        let map = unsafe { Mmap::map(&file) }?;
        Ok(Self {
            name: name.to_owned(),
            map,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_aligned() {
        let page = page_size::get();
        assert_eq!(page_aligned(0), Some(page));
        assert_eq!(page_aligned(1), Some(page));
        assert_eq!(page_aligned(page), Some(page));
        assert_eq!(page_aligned(page + 1), Some(2 * page));
        assert_eq!(page_aligned(usize::MAX), None);
    }

    #[test]
    fn test_oversized_region_is_refused() {
        let name = format!("camhub-shm-huge.{}", std::process::id());
        // 1 TiB, beyond any shared-memory mount a test host carries.
        let result = OwnedRegion::create(&name, 1 << 40);
        assert!(matches!(result, Err(Error::Allocation { .. })));
        assert!(AttachedRegion::attach(&name).is_err());
    }

    #[test]
    fn test_owner_writes_attacher_sees() {
        let name = format!("camhub-shm-test.{}", std::process::id());
        let mut owned = OwnedRegion::create(&name, 64).unwrap();
        owned.as_mut_slice().unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);

        let attached = AttachedRegion::attach(&name).unwrap();
        assert_eq!(&attached.as_slice()[..4], &[1, 2, 3, 4]);

        owned.as_mut_slice().unwrap()[0] = 9;
        assert_eq!(attached.as_slice()[0], 9);

        owned.release();
        owned.release();
        assert!(owned.is_released());
        assert!(AttachedRegion::attach(&name).is_err());
    }
}
