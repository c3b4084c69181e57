//! BAR1 register window
//!
//! The controller's system-interface registers are reached by mapping the
//! sysfs `resource1` file of the PCI function. Only the first 4 KiB are
//! mapped, and only the named registers of [`Register`] can be accessed.
//!
//! Uses rustix for mmap/munmap.

use crate::error::{LsiError, Result};
use lsi_chip::regs::BAR1_WINDOW_SIZE;
use lsi_chip::Register;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::OpenOptions;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// 32-bit access to the named BAR1 registers.
pub trait RegisterIo {
    /// Read a register.
    fn read32(&self, reg: Register) -> u32;

    /// Write a register.
    fn write32(&mut self, reg: Register, value: u32);
}

impl<R: RegisterIo + ?Sized> RegisterIo for &mut R {
    fn read32(&self, reg: Register) -> u32 {
        (**self).read32(reg)
    }

    fn write32(&mut self, reg: Register, value: u32) {
        (**self).write32(reg, value);
    }
}

/// Memory-mapped BAR1 window
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    path: PathBuf,
}

impl MmapRegion {
    /// Map BAR1 of `pci_id` below `sysfs_root`.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::MappingFailed`] if the resource file cannot be
    /// opened or mapped.
    pub fn open(sysfs_root: &Path, pci_id: &str) -> Result<Self> {
        let path = sysfs_root
            .join("bus/pci/devices")
            .join(pci_id)
            .join("resource1");

        tracing::debug!("Mapping BAR1: {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| LsiError::mapping_failed(&path, format!("open: {e}")))?;

        // SAFETY: mmap of a PCI resource file.
        // - fd is valid (opened above) and stays valid for the call; the
        //   mapping outlives it, which POSIX allows
        // - length is the fixed register window, offset 0
        // - MAP_SHARED so stores reach the device
        // - the returned region is released exactly once, in Drop
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                BAR1_WINDOW_SIZE,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| LsiError::mapping_failed(&path, format!("mmap: {e}")))?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| LsiError::mapping_failed(&path, "mmap returned null"))?;

        tracing::debug!("Mapped BAR1 at {ptr:p}");

        Ok(Self { ptr, path })
    }

    /// Resource file backing the mapping.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegisterIo for MmapRegion {
    fn read32(&self, reg: Register) -> u32 {
        let offset = reg.offset();
        debug_assert!(offset + 4 <= BAR1_WINDOW_SIZE);

        // SAFETY: volatile MMIO load.
        // - every Register offset is 4-byte aligned and inside the 4 KiB
        //   window (checked by lsi-chip tests)
        // - ptr is the live mapping from open()
        // - volatile keeps the access ordered and uncached from the
        //   compiler's point of view
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };

        tracing::trace!("read  {reg:?} = {value:#010x}");
        value
    }

    fn write32(&mut self, reg: Register, value: u32) {
        let offset = reg.offset();
        debug_assert!(offset + 4 <= BAR1_WINDOW_SIZE);

        tracing::trace!("write {reg:?} = {value:#010x}");

        // SAFETY: volatile MMIO store; same invariants as read32, plus
        // &mut self gives exclusive access to the window.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr
                .as_ptr()
                .add(offset)
                .cast::<u32>()
                .write_volatile(value);
        }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len are exactly what mmap returned in open(); Drop runs
        // once and no references into the mapping outlive self.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), BAR1_WINDOW_SIZE) } {
            tracing::error!("munmap of {} failed: {e}", self.path.display());
        }
    }
}

// SAFETY: MmapRegion owns its mapping exclusively; the mapping is valid from
// any thread. Writes need &mut self.
unsafe impl Send for MmapRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_resource_is_mapping_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = MmapRegion::open(dir.path(), "0000:01:00.0").unwrap_err();
        match err {
            LsiError::MappingFailed { path, .. } => {
                assert!(path.ends_with("bus/pci/devices/0000:01:00.0/resource1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn maps_regular_file_as_window() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("bus/pci/devices/0000:01:00.0");
        std::fs::create_dir_all(&dev).unwrap();
        let res = dev.join("resource1");
        std::fs::write(&res, vec![0u8; BAR1_WINDOW_SIZE]).unwrap();

        let mut region = MmapRegion::open(dir.path(), "0000:01:00.0").unwrap();
        region.write32(Register::HcbSize, 0x0020_0001);
        assert_eq!(region.read32(Register::HcbSize), 0x0020_0001);
        drop(region);

        let bytes = std::fs::read(&res).unwrap();
        assert_eq!(&bytes[0x74..0x78], &0x0020_0001u32.to_le_bytes());
    }
}
