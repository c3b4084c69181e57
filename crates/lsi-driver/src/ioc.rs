//! IOC lifecycle: reset, halt and host boot
//!
//! The IOC's coarse state is the top nibble of the doorbell. The
//! controller drives it through the host diagnostic register of the
//! detected personality:
//!
//! ```text
//! reset:     clear boot select / HCB -> RESET_ADAPTER -> poll READY
//! halt:      FORCE_HCB | RESET_ADAPTER -> re-detect -> clear FORCE_HCB
//!            -> doorbell must read RESET
//! host boot: halt -> program HCDW window with firmware -> boot from HCDW
//!            -> poll READY -> tear the window down
//! ```
//!
//! Every adapter reset can change the firmware personality, so the mode is
//! re-detected after each one and the new [`ModeDetection`] is kept.

use std::fmt;

use bitflags::bitflags;

use crate::config::Timing;
use crate::delay::Delay;
use crate::dma::{stage_firmware, DmaAllocator, DmaMemory};
use crate::error::{LsiError, Result};
use crate::mmio::RegisterIo;
use crate::mode::{self, ModeDetection};
use crate::sysfs::PciControl;
use lsi_chip::regs::{diag, doorbell, hcb};
use lsi_chip::{Register, RegisterSet};

bitflags! {
    /// Decoded doorbell state flags. No flag set means the IOC is in reset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DoorbellState: u32 {
        /// Waiting for host initialization.
        const READY = doorbell::READY;
        /// Firmware running.
        const OPERATIONAL = doorbell::OPERATIONAL;
        /// Firmware faulted.
        const FAULT = doorbell::FAULT;
    }
}

impl DoorbellState {
    /// Decode a raw doorbell value.
    pub const fn decode(raw: u32) -> Self {
        Self::from_bits_truncate(raw)
    }

    /// No state flag set.
    pub const fn is_reset(self) -> bool {
        self.is_empty()
    }
}

impl fmt::Display for DoorbellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_reset() {
            return f.write_str("RESET");
        }
        let mut sep = "";
        for (name, _) in self.iter_names() {
            write!(f, "{sep}{name}")?;
            sep = " ";
        }
        Ok(())
    }
}

/// Read and decode the doorbell.
pub fn doorbell_state<R: RegisterIo + ?Sized>(regs: &R) -> DoorbellState {
    DoorbellState::decode(regs.read32(Register::Doorbell))
}

/// Poll the doorbell until READY, at most `timing.ready_polls` times.
///
/// # Errors
///
/// Returns [`LsiError::IocNotReady`] with the last doorbell value.
pub fn wait_for_ready<R: RegisterIo + ?Sized, D: Delay + ?Sized>(
    regs: &R,
    delay: &mut D,
    timing: &Timing,
) -> Result<DoorbellState> {
    let mut raw = 0;
    for poll in 1..=timing.ready_polls {
        raw = regs.read32(Register::Doorbell);
        let state = DoorbellState::decode(raw);
        if state.contains(DoorbellState::READY) {
            tracing::debug!("IOC ready after {poll} polls ({state})");
            return Ok(state);
        }
        delay.delay(timing.ready_interval);
    }

    let waited_ms = u64::try_from(timing.ready_timeout().as_millis()).unwrap_or(u64::MAX);
    tracing::warn!("IOC not ready after {waited_ms}ms, doorbell {raw:#010x}");
    Err(LsiError::IocNotReady {
        doorbell: raw,
        waited_ms,
    })
}

/// Read-modify-write the host diagnostic register: set `set`, then clear
/// `clear`.
fn modify_diag<R: RegisterIo + ?Sized>(regs: &mut R, rs: RegisterSet, set: u32, clear: u32) {
    let reg = rs.host_diagnostic();
    let before = regs.read32(reg);
    let after = (before | set) & !clear;
    tracing::debug!("HostDiagnostic {before:#010x} -> {after:#010x}");
    regs.write32(reg, after);
}

/// HCDW registers programmed for the life of the value. Dropping it
/// disables the window and zeroes the address.
pub struct HcdwWindow<'r, R: RegisterIo + ?Sized> {
    regs: &'r mut R,
}

impl<'r, R: RegisterIo + ?Sized> HcdwWindow<'r, R> {
    /// Point the IOC at `size` bytes of host memory at `physical`.
    pub fn program(regs: &'r mut R, physical: u64, size: usize) -> Self {
        // Window sizes are at most one huge page.
        #[allow(clippy::cast_possible_truncation)]
        let size_reg = (size as u32 & hcb::SIZE_MASK) | hcb::SIZE_ENABLE;
        #[allow(clippy::cast_possible_truncation)]
        let (low, high) = (physical as u32, (physical >> 32) as u32);

        regs.write32(Register::HcbAddressLow, low);
        regs.write32(Register::HcbAddressHigh, high);
        regs.write32(Register::HcbSize, size_reg);
        tracing::debug!("HCDW window at {physical:#x}, size register {size_reg:#010x}");
        Self { regs }
    }

    /// Register access while the window stays programmed.
    pub fn regs(&mut self) -> &mut R {
        self.regs
    }
}

impl<R: RegisterIo + ?Sized> Drop for HcdwWindow<'_, R> {
    fn drop(&mut self) {
        self.regs.write32(Register::HcbSize, 0);
        self.regs.write32(Register::HcbAddressLow, 0);
        self.regs.write32(Register::HcbAddressHigh, 0);
        tracing::debug!("HCDW window disabled");
    }
}

/// Lifecycle operations on one mapped controller.
pub struct IocController<'a, R: RegisterIo + ?Sized, D: Delay + ?Sized> {
    regs: &'a mut R,
    delay: &'a mut D,
    timing: &'a Timing,
    detection: ModeDetection,
}

impl<'a, R: RegisterIo + ?Sized, D: Delay + ?Sized> IocController<'a, R, D> {
    /// Controller starting from an existing detection result.
    pub fn new(
        regs: &'a mut R,
        detection: ModeDetection,
        delay: &'a mut D,
        timing: &'a Timing,
    ) -> Self {
        Self {
            regs,
            delay,
            timing,
            detection,
        }
    }

    /// Personality as of the last detection.
    pub const fn detection(&self) -> ModeDetection {
        self.detection
    }

    /// Current doorbell state.
    pub fn state(&self) -> DoorbellState {
        doorbell_state(&*self.regs)
    }

    fn redetect(&mut self) -> Result<RegisterSet> {
        let previous = self.detection;
        self.detection = mode::detect(&mut *self.regs);
        if self.detection.register_set != previous.register_set {
            tracing::info!(
                "Personality changed across reset: {} -> {}",
                previous.register_set,
                self.detection.register_set
            );
        }
        self.detection.require_unlocked()
    }

    /// Reset the adapter and boot it from flash.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::UnlockFailed`] if diagnostic writes are locked,
    /// [`LsiError::Sysfs`] if unbinding fails, or [`LsiError::IocNotReady`]
    /// if the doorbell never shows READY.
    pub fn reset<P: PciControl + ?Sized>(&mut self, pci: &mut P) -> Result<DoorbellState> {
        let set = self.detection.require_unlocked()?;
        pci.unbind()?;

        tracing::info!("Resetting adapter...");
        modify_diag(
            &mut *self.regs,
            set,
            0,
            diag::BOOT_DEVICE_SELECT_MASK | diag::FORCE_HCB_ON_RESET | diag::HCB_MODE,
        );
        self.delay.delay(self.timing.reset_settle);
        modify_diag(&mut *self.regs, set, diag::RESET_ADAPTER, 0);
        self.delay.delay(self.timing.reset_settle);

        let ready = wait_for_ready(&*self.regs, &mut *self.delay, self.timing);
        let redetected = self.redetect();
        let state = ready?;
        redetected?;
        tracing::info!("IOC is READY");
        Ok(state)
    }

    /// Reset into host-control-bus mode with the IOC held, so firmware does
    /// not boot.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::UnlockFailed`] if the diagnostic interface is
    /// locked before or after the reset, or [`LsiError::HaltFailed`] if the
    /// doorbell shows any state afterwards.
    pub fn halt<P: PciControl + ?Sized>(&mut self, pci: &mut P) -> Result<()> {
        let set = self.detection.require_unlocked()?;
        pci.unbind()?;

        tracing::info!("Resetting adapter in HCB mode...");
        modify_diag(
            &mut *self.regs,
            set,
            diag::FORCE_HCB_ON_RESET | diag::RESET_ADAPTER,
            0,
        );
        self.delay.delay(self.timing.halt_settle);

        let set = self.redetect()?;
        modify_diag(&mut *self.regs, set, 0, diag::FORCE_HCB_ON_RESET);

        let raw = self.regs.read32(Register::Doorbell);
        if raw & doorbell::STATE_MASK != 0 {
            tracing::error!("IOC failed to halt, doorbell {raw:#010x}");
            return Err(LsiError::HaltFailed { doorbell: raw });
        }
        tracing::info!("IOC halted");
        Ok(())
    }

    /// Halt, then boot `image` from a host DMA window instead of flash.
    ///
    /// The window registers are cleared and the memory released on every
    /// exit path once they have been set up. A booted IOC whose diagnostic
    /// interface stays locked is still a successful boot; the failed unlock
    /// is logged and reflected in the detection.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::FirmwareTooLarge`] before touching the card if
    /// the image exceeds the window, any error of [`IocController::halt`],
    /// [`LsiError::Dma`] or [`LsiError::Sysfs`] during setup, or
    /// [`LsiError::IocNotReady`] if the booted firmware never reports READY.
    pub fn host_boot<P, A>(&mut self, pci: &mut P, alloc: &mut A, image: &[u8]) -> Result<()>
    where
        P: PciControl + ?Sized,
        A: DmaAllocator + ?Sized,
    {
        if image.len() > hcb::WINDOW_SIZE {
            return Err(LsiError::FirmwareTooLarge {
                size: image.len(),
                max: hcb::WINDOW_SIZE,
            });
        }

        self.halt(pci)?;
        let set = self.detection.require_unlocked()?;

        modify_diag(
            &mut *self.regs,
            set,
            diag::CLEAR_FLASH_BAD_SIG,
            diag::RESET_HISTORY | diag::BOOT_DEVICE_SELECT_MASK | diag::FORCE_HCB_ON_RESET,
        );

        let mut memory = alloc.allocate(hcb::WINDOW_SIZE)?;
        pci.enable_bus_master()?;

        let ready = {
            let mut window =
                HcdwWindow::program(&mut *self.regs, memory.physical_address(), memory.len());
            stage_firmware(memory.as_mut_slice(), image)?;
            tracing::info!(
                "Booting {} byte image from host memory at {:#x}",
                image.len(),
                memory.physical_address()
            );

            modify_diag(
                window.regs(),
                set,
                diag::BOOT_DEVICE_HCDW,
                (diag::BOOT_DEVICE_SELECT_MASK & !diag::BOOT_DEVICE_HCDW)
                    | diag::HOLD_IOC_RESET
                    | diag::FORCE_HCB_ON_RESET,
            );

            let ready = wait_for_ready(&*window.regs(), &mut *self.delay, self.timing);
            if ready.is_ok() {
                self.delay.delay(self.timing.boot_settle);
            }
            ready
        };
        drop(memory);

        let state = ready?;
        if let Err(e) = self.redetect() {
            tracing::warn!("IOC booted but diagnostic unlock failed: {e}");
        }
        tracing::info!("IOC booted from host memory ({state})");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_decoding() {
        assert!(DoorbellState::decode(0x0000_1234).is_reset());
        assert_eq!(DoorbellState::decode(0x1000_0000), DoorbellState::READY);
        let s = DoorbellState::decode(0x5000_0123);
        assert!(s.contains(DoorbellState::READY | DoorbellState::FAULT));
        assert!(!s.contains(DoorbellState::OPERATIONAL));
    }

    #[test]
    fn doorbell_display() {
        assert_eq!(DoorbellState::decode(0).to_string(), "RESET");
        assert_eq!(DoorbellState::decode(0x2000_0000).to_string(), "OPERATIONAL");
        assert_eq!(DoorbellState::decode(0x5000_0000).to_string(), "READY FAULT");
    }
}
