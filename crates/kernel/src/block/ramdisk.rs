/// Ramdisk block device over the initrd image.
///
/// The device window is byte-exact with the image the loader handed over;
/// writes land in place. The boot path wraps the DTB-reported initrd range,
/// tests allocate their own backing buffer.

use alloc::string::String;
use alloc::sync::Arc;

use super::{BlockDevice, BlockDeviceOps, SECTOR_SIZE};
use crate::klib::error::Result;
use crate::sync::SleepLock;

pub struct Ramdisk {
    base: *mut u8,
    len: usize,
    /// Serializes raw window access; copies are long, so holders may block
    lock: SleepLock<()>,
}

unsafe impl Send for Ramdisk {}
unsafe impl Sync for Ramdisk {}

impl Ramdisk {
    /// Wrap an existing physical window.
    ///
    /// # Safety
    /// `base..base+len` must stay valid and exclusively owned by this
    /// device for its lifetime.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Ramdisk {
        Ramdisk {
            base,
            len,
            lock: SleepLock::new("ramdisk", ()),
        }
    }

    /// Fresh zeroed backing store (tests, scratch disks).
    pub fn with_capacity(len: usize) -> Ramdisk {
        let buf = alloc::vec![0u8; len].leak();
        unsafe { Ramdisk::from_raw(buf.as_mut_ptr(), buf.len()) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn window(&self, sector: u64, bytes: usize) -> Option<(usize, usize)> {
        let off = sector as usize * SECTOR_SIZE;
        if off + bytes > self.len {
            return None;
        }
        Some((off, bytes))
    }
}

impl BlockDeviceOps for Ramdisk {
    fn read_sectors(&self, _dev: &BlockDevice, sector: u64, buf: &mut [u8]) -> Result<()> {
        let (off, n) = self
            .window(sector, buf.len())
            .ok_or(crate::klib::error::Errno::EINVAL)?;
        let _g = self.lock.acquire();
        unsafe {
            core::ptr::copy_nonoverlapping(self.base.add(off), buf.as_mut_ptr(), n);
        }
        Ok(())
    }

    fn write_sectors(&self, _dev: &BlockDevice, sector: u64, buf: &[u8]) -> Result<()> {
        let (off, n) = self
            .window(sector, buf.len())
            .ok_or(crate::klib::error::Errno::EINVAL)?;
        let _g = self.lock.acquire();
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), self.base.add(off), n);
        }
        Ok(())
    }

    fn flush(&self, _dev: &BlockDevice) -> Result<()> {
        // Memory-backed; nothing to push down
        Ok(())
    }
}

/// Build and register the boot ramdisk over the initrd range.
pub fn init_from_initrd(start: u64, end: u64) -> Option<Arc<BlockDevice>> {
    if end <= start {
        return None;
    }
    let len = (end - start) as usize;
    let sectors = (len / SECTOR_SIZE) as u64;
    let rd = unsafe { Ramdisk::from_raw(start as usize as *mut u8, len) };
    let dev = Arc::new(BlockDevice::new(
        String::from("rd0"),
        1,
        0,
        sectors,
        Arc::new(rd),
    ));
    super::register_device(dev.clone());
    crate::info!("ramdisk: {} sectors from initrd at {:#x}", sectors, start);
    Some(dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_is_byte_exact() {
        let mut image = alloc::vec![0u8; 4 * SECTOR_SIZE];
        for (i, b) in image.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let backing = image.clone().leak();
        let rd = unsafe { Ramdisk::from_raw(backing.as_mut_ptr(), backing.len()) };
        let dev = BlockDevice::new(String::from("rdx"), 1, 1, 4, Arc::new(rd));

        let mut buf = alloc::vec![0u8; 4 * SECTOR_SIZE];
        dev.read_sectors(0, &mut buf).unwrap();
        assert_eq!(buf, image);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let rd = Ramdisk::with_capacity(8 * SECTOR_SIZE);
        let dev = BlockDevice::new(String::from("rdy"), 1, 2, 8, Arc::new(rd));

        let data = alloc::vec![0x5au8; 2 * SECTOR_SIZE];
        dev.write_sectors(4, &data).unwrap();
        let mut back = alloc::vec![0u8; 2 * SECTOR_SIZE];
        dev.read_sectors(4, &mut back).unwrap();
        assert_eq!(back, data);

        // Neighbouring sectors untouched
        let mut third = alloc::vec![0u8; SECTOR_SIZE];
        dev.read_sectors(3, &mut third).unwrap();
        assert!(third.iter().all(|&b| b == 0));
    }
}
