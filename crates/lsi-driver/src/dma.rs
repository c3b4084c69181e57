//! Host-boot DMA window
//!
//! The IOC fetches boot firmware from a physically contiguous host buffer
//! programmed into the HCDW registers. One 2 MiB huge page gives that
//! contiguity without a kernel driver: the page is mapped anonymous with
//! `MAP_HUGETLB | MAP_LOCKED`, pinned with `mlock`, and its physical
//! address is looked up in `/proc/self/pagemap`.
//!
//! The window is unmapped when the [`DmaMemory`] value is dropped, on
//! every exit path of a host boot.

use crate::error::{LsiError, Result};
use lsi_chip::regs::hcb;
use rustix::mm::{mlock, mmap_anonymous, munlock, munmap, MapFlags, ProtFlags};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Default page-table pseudo-file.
pub const PAGEMAP_PATH: &str = "/proc/self/pagemap";

const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

/// Device-visible host memory.
pub trait DmaMemory {
    /// Bus address of the first byte.
    fn physical_address(&self) -> u64;

    /// CPU view of the whole window.
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Window size in bytes.
    fn len(&self) -> usize;

    /// Whether the window is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of [`DmaMemory`] windows.
pub trait DmaAllocator {
    /// Window type handed out.
    type Memory: DmaMemory;

    /// Allocate a physically contiguous window of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::Dma`] if the memory cannot be mapped, locked or
    /// translated.
    fn allocate(&mut self, size: usize) -> Result<Self::Memory>;
}

/// Huge-page backed allocator.
#[derive(Debug, Clone)]
pub struct HugePageAllocator {
    pagemap: PathBuf,
}

impl Default for HugePageAllocator {
    fn default() -> Self {
        Self {
            pagemap: PathBuf::from(PAGEMAP_PATH),
        }
    }
}

impl HugePageAllocator {
    /// Allocator using the running process's pagemap.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DmaAllocator for HugePageAllocator {
    type Memory = HugePageWindow;

    fn allocate(&mut self, size: usize) -> Result<HugePageWindow> {
        if size == 0 || size > hcb::WINDOW_SIZE {
            return Err(LsiError::dma(format!(
                "window size {size:#x} must be 1..={:#x}",
                hcb::WINDOW_SIZE
            )));
        }

        // SAFETY: anonymous private mapping, no fd involved.
        // - null hint, so the kernel picks a fresh range that aliases nothing
        // - MAP_HUGETLB gives one physically contiguous huge page
        // - released exactly once in HugePageWindow::drop
        let ptr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                hcb::WINDOW_SIZE,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE | MapFlags::HUGETLB | MapFlags::LOCKED | MapFlags::POPULATE,
            )
        }
        .map_err(|e| LsiError::dma(format!("huge page mmap: {e} (are hugepages reserved?)")))?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| LsiError::dma("huge page mmap returned null"))?;

        // From here on the window owns the mapping and cleans up on error.
        let mut window = HugePageWindow {
            ptr,
            len: size,
            physical: 0,
            locked: false,
        };

        // SAFETY: ptr/len describe the mapping created above.
        unsafe { mlock(ptr.as_ptr().cast(), hcb::WINDOW_SIZE) }
            .map_err(|e| LsiError::dma(format!("mlock: {e}")))?;
        window.locked = true;

        window.physical = physical_address_of(&self.pagemap, ptr.as_ptr() as usize)?;
        tracing::debug!(
            "DMA window: virt={ptr:p} phys={:#x} size={size:#x}",
            window.physical
        );
        Ok(window)
    }
}

/// Locked huge-page mapping.
#[derive(Debug)]
pub struct HugePageWindow {
    ptr: NonNull<u8>,
    len: usize,
    physical: u64,
    locked: bool,
}

impl DmaMemory for HugePageWindow {
    fn physical_address(&self) -> u64 {
        self.physical
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for WINDOW_SIZE >= len bytes for the life of
        // self; &mut self rules out aliasing from the CPU side.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HugePageWindow {
    fn drop(&mut self) {
        if self.locked {
            // SAFETY: same range that was mlock'd in allocate().
            if let Err(e) = unsafe { munlock(self.ptr.as_ptr().cast(), hcb::WINDOW_SIZE) } {
                tracing::error!("munlock of DMA window failed: {e}");
            }
        }
        // SAFETY: ptr/len are exactly what mmap_anonymous returned; nothing
        // borrows the mapping once self is being dropped.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), hcb::WINDOW_SIZE) } {
            tracing::error!("munmap of DMA window failed: {e}");
        }
        tracing::debug!("DMA window at {:#x} released", self.physical);
    }
}

/// Translate a virtual address of this process through `pagemap`.
///
/// # Errors
///
/// Returns [`LsiError::Dma`] if the entry cannot be read, the page is not
/// present, or the frame number is hidden (no `CAP_SYS_ADMIN`).
pub fn physical_address_of(pagemap: &Path, vaddr: usize) -> Result<u64> {
    let page_size = rustix::param::page_size();
    let file = File::open(pagemap)
        .map_err(|e| LsiError::dma(format!("open {}: {e}", pagemap.display())))?;

    let mut entry = [0u8; 8];
    let index = (vaddr / page_size) as u64;
    file.read_exact_at(&mut entry, index * 8)
        .map_err(|e| LsiError::dma(format!("read {}: {e}", pagemap.display())))?;

    decode_pagemap_entry(u64::from_le_bytes(entry), vaddr, page_size)
}

/// Physical address from one pagemap entry.
///
/// # Errors
///
/// Returns [`LsiError::Dma`] for a non-present page or a zero frame number.
pub fn decode_pagemap_entry(entry: u64, vaddr: usize, page_size: usize) -> Result<u64> {
    if entry & PAGEMAP_PRESENT == 0 {
        return Err(LsiError::dma(format!("page at {vaddr:#x} not present")));
    }
    let pfn = entry & PAGEMAP_PFN_MASK;
    if pfn == 0 {
        return Err(LsiError::dma("page frame number hidden; run as root"));
    }
    Ok(pfn * page_size as u64 + (vaddr % page_size) as u64)
}

/// Copy `image` to the end of `window`, filling the bytes in front of it
/// with [`hcb::FILL_BYTE`].
///
/// # Errors
///
/// Returns [`LsiError::FirmwareTooLarge`] if the image does not fit.
pub fn stage_firmware(window: &mut [u8], image: &[u8]) -> Result<()> {
    let start = window
        .len()
        .checked_sub(image.len())
        .ok_or(LsiError::FirmwareTooLarge {
            size: image.len(),
            max: window.len(),
        })?;
    let (pad, tail) = window.split_at_mut(start);
    pad.fill(hcb::FILL_BYTE);
    tail.copy_from_slice(image);
    Ok(())
}
