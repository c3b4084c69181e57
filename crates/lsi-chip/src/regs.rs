//! BAR1 register map.
//!
//! The IOC exposes the same 4 KiB system-interface window in both firmware
//! personalities, but the diagnostic block moves: MPT firmware puts it at
//! 0x04..0x18, MegaRAID firmware at 0x24..0x2c and 0xf8..0xfc. The doorbell,
//! DCR and HCB registers do not move.
//!
//! ```text
//! 0x00  Doorbell             top nibble = IOC state flags
//! 0x04  WriteSequence        (MPT)       unlock key is written here
//! 0x08  HostDiagnostic       (MPT)       reset / HCB / boot-device control
//! 0x10  DiagRwData           (MPT)       indirect chip-space data
//! 0x14  DiagRwAddressLow     (MPT)
//! 0x18  DiagRwAddressHigh    (MPT)
//! 0x24  DiagRwData           (MegaRAID)
//! 0x28  DiagRwAddressLow     (MegaRAID)
//! 0x2c  DiagRwAddressHigh    (MegaRAID)
//! 0x38  DcrData
//! 0x3c  DcrAddress
//! 0x74  HcbSize              size | enable
//! 0x78  HcbAddressLow
//! 0x7c  HcbAddressHigh
//! 0xf8  HostDiagnostic       (MegaRAID)
//! 0xfc  WriteSequence        (MegaRAID)
//! ```

use std::fmt;

/// Size of the BAR1 mapping. Every register below lives inside it.
pub const BAR1_WINDOW_SIZE: usize = 0x1000;

// ── Named registers ──────────────────────────────────────────────────────────

/// Every BAR1 register the tools touch.
///
/// Access goes through this enum rather than raw offsets so that nothing can
/// read or write outside the known register set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// IOC doorbell / state register.
    Doorbell,
    /// MPT write-sequence (unlock key) register.
    MptWriteSequence,
    /// MPT host diagnostic register.
    MptHostDiagnostic,
    /// MPT indirect data register.
    MptDiagRwData,
    /// MPT indirect address, low 32 bits.
    MptDiagRwAddressLow,
    /// MPT indirect address, high 32 bits.
    MptDiagRwAddressHigh,
    /// MegaRAID indirect data register.
    MrDiagRwData,
    /// MegaRAID indirect address, low 32 bits.
    MrDiagRwAddressLow,
    /// MegaRAID indirect address, high 32 bits.
    MrDiagRwAddressHigh,
    /// Deep Control Register data.
    DcrData,
    /// Deep Control Register address.
    DcrAddress,
    /// Host Control Data Window size and enable.
    HcbSize,
    /// Host Control Data Window physical address, low 32 bits.
    HcbAddressLow,
    /// Host Control Data Window physical address, high 32 bits.
    HcbAddressHigh,
    /// MegaRAID host diagnostic register.
    MrHostDiagnostic,
    /// MegaRAID write-sequence (unlock key) register.
    MrWriteSequence,
}

impl Register {
    /// All registers, in offset order.
    pub const ALL: [Register; 16] = [
        Register::Doorbell,
        Register::MptWriteSequence,
        Register::MptHostDiagnostic,
        Register::MptDiagRwData,
        Register::MptDiagRwAddressLow,
        Register::MptDiagRwAddressHigh,
        Register::MrDiagRwData,
        Register::MrDiagRwAddressLow,
        Register::MrDiagRwAddressHigh,
        Register::DcrData,
        Register::DcrAddress,
        Register::HcbSize,
        Register::HcbAddressLow,
        Register::HcbAddressHigh,
        Register::MrHostDiagnostic,
        Register::MrWriteSequence,
    ];

    /// Byte offset inside BAR1.
    pub const fn offset(self) -> usize {
        match self {
            Register::Doorbell => 0x00,
            Register::MptWriteSequence => 0x04,
            Register::MptHostDiagnostic => 0x08,
            Register::MptDiagRwData => 0x10,
            Register::MptDiagRwAddressLow => 0x14,
            Register::MptDiagRwAddressHigh => 0x18,
            Register::MrDiagRwData => 0x24,
            Register::MrDiagRwAddressLow => 0x28,
            Register::MrDiagRwAddressHigh => 0x2c,
            Register::DcrData => 0x38,
            Register::DcrAddress => 0x3c,
            Register::HcbSize => 0x74,
            Register::HcbAddressLow => 0x78,
            Register::HcbAddressHigh => 0x7c,
            Register::MrHostDiagnostic => 0xf8,
            Register::MrWriteSequence => 0xfc,
        }
    }
}

// ── Personality register sets ────────────────────────────────────────────────

/// Which diagnostic register layout the running firmware exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterSet {
    /// IT/IR (MPT) firmware layout.
    Mpt,
    /// MegaRAID firmware layout.
    MegaRaid,
}

impl RegisterSet {
    /// Detection order: MPT first, then MegaRAID.
    pub const PROBE_ORDER: [RegisterSet; 2] = [RegisterSet::Mpt, RegisterSet::MegaRaid];

    /// Host diagnostic register.
    pub const fn host_diagnostic(self) -> Register {
        match self {
            RegisterSet::Mpt => Register::MptHostDiagnostic,
            RegisterSet::MegaRaid => Register::MrHostDiagnostic,
        }
    }

    /// Write-sequence (unlock key) register.
    pub const fn write_sequence(self) -> Register {
        match self {
            RegisterSet::Mpt => Register::MptWriteSequence,
            RegisterSet::MegaRaid => Register::MrWriteSequence,
        }
    }

    /// Indirect data register.
    pub const fn rw_data(self) -> Register {
        match self {
            RegisterSet::Mpt => Register::MptDiagRwData,
            RegisterSet::MegaRaid => Register::MrDiagRwData,
        }
    }

    /// Indirect address register, low half.
    pub const fn rw_address_low(self) -> Register {
        match self {
            RegisterSet::Mpt => Register::MptDiagRwAddressLow,
            RegisterSet::MegaRaid => Register::MrDiagRwAddressLow,
        }
    }

    /// Indirect address register, high half.
    pub const fn rw_address_high(self) -> Register {
        match self {
            RegisterSet::Mpt => Register::MptDiagRwAddressHigh,
            RegisterSet::MegaRaid => Register::MrDiagRwAddressHigh,
        }
    }
}

impl fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterSet::Mpt => f.write_str("MPT"),
            RegisterSet::MegaRaid => f.write_str("MegaRAID"),
        }
    }
}

/// Key written byte-by-byte to the write-sequence register to unlock
/// diagnostic writes.
pub const UNLOCK_KEY: [u32; 6] = [0x00, 0x04, 0x0b, 0x02, 0x07, 0x0d];

// ── Host diagnostic bits ─────────────────────────────────────────────────────

/// Host diagnostic register bit definitions.
pub mod diag {
    /// Boot device select field.
    pub const BOOT_DEVICE_SELECT_MASK: u32 = 0x0000_1800;
    /// Boot from on-card flash.
    pub const BOOT_DEVICE_DEFAULT: u32 = 0x0000_0000;
    /// Boot from the Host Control Data Window.
    pub const BOOT_DEVICE_HCDW: u32 = 0x0000_0800;
    /// Write 1 to clear the flash-bad-signature latch.
    pub const CLEAR_FLASH_BAD_SIG: u32 = 0x0000_0400;
    /// Enter host-control-bus mode on the next adapter reset.
    pub const FORCE_HCB_ON_RESET: u32 = 0x0000_0200;
    /// IOC is in host-control-bus mode.
    pub const HCB_MODE: u32 = 0x0000_0100;
    /// Diagnostic writes are unlocked.
    pub const WRITE_ENABLE: u32 = 0x0000_0080;
    /// Flash image failed its signature check.
    pub const FLASH_BAD_SIG: u32 = 0x0000_0040;
    /// An adapter reset happened since this bit was last cleared.
    pub const RESET_HISTORY: u32 = 0x0000_0020;
    /// Enables the indirect read/write data path.
    pub const RW_ENABLE: u32 = 0x0000_0010;
    /// Reset the whole adapter.
    pub const RESET_ADAPTER: u32 = 0x0000_0004;
    /// Hold the IOC core in reset.
    pub const HOLD_IOC_RESET: u32 = 0x0000_0002;
}

// ── Doorbell ─────────────────────────────────────────────────────────────────

/// Doorbell register bit definitions.
pub mod doorbell {
    /// IOC state flags live in the top nibble.
    pub const STATE_MASK: u32 = 0xf000_0000;
    /// IOC finished its reset and waits for IOCInit.
    pub const READY: u32 = 0x1000_0000;
    /// IOC is running.
    pub const OPERATIONAL: u32 = 0x2000_0000;
    /// IOC faulted; the low 16 bits carry the fault code.
    pub const FAULT: u32 = 0x4000_0000;
    /// Fault code field.
    pub const FAULT_CODE_MASK: u32 = 0x0000_ffff;
}

// ── Host Control Data Window ─────────────────────────────────────────────────

/// HCB/HCDW register bit definitions and host-boot constants.
pub mod hcb {
    /// Enable bit in `HcbSize`.
    pub const SIZE_ENABLE: u32 = 0x0000_0001;
    /// Size field in `HcbSize` (4 KiB granularity).
    pub const SIZE_MASK: u32 = 0xffff_f000;
    /// Host-boot window size. One 2 MiB huge page.
    pub const WINDOW_SIZE: usize = 2 * 1024 * 1024;
    /// Fill byte placed in front of a tail-aligned firmware image.
    pub const FILL_BYTE: u8 = 0x42;
}

// ── Deep Control Registers ───────────────────────────────────────────────────

/// DCR addresses and bits.
pub mod dcr {
    /// Routes the SBR I2C bus between firmware and host.
    pub const I2C_SELECT: u32 = 0x307;
    /// Hand the I2C pins to the host.
    pub const I2C_SELECT_HOST: u32 = 0x0080_0000;
    /// SBR strap configuration.
    pub const SBR_CONFIG: u32 = 0x340;
    /// Set when the SBR EEPROM answers at the alternate address.
    pub const SBR_CONFIG_ALT_ADDRESS: u32 = 1 << 1;
    /// Set when the SBR EEPROM uses 16-bit offsets.
    pub const SBR_CONFIG_WIDE_OFFSET: u32 = 1 << 3;
}

// ── Chip-config space (via the diagnostic bridge) ────────────────────────────

/// SoC-internal registers reached through the diagnostic indirect bridge.
pub mod chip {
    /// I2C controller block.
    pub const I2C_BASE: u32 = 0xc210_0000;
    /// Raw SCL/SDA pin register.
    pub const I2C_PINS: u32 = I2C_BASE + 0x20;
    /// I2C block reset; self-clearing.
    pub const I2C_RESET: u32 = I2C_BASE + 0x24;

    /// SCL level as seen on the bus.
    pub const PIN_SCL_READ: u32 = 0x01;
    /// SDA level as seen on the bus.
    pub const PIN_SDA_READ: u32 = 0x02;
    /// Pull SCL low.
    pub const PIN_SCL_DRIVE: u32 = 0x04;
    /// Pull SDA low.
    pub const PIN_SDA_DRIVE: u32 = 0x08;

    /// Reset request / busy bit in `I2C_RESET`.
    pub const I2C_RESET_ACTIVE: u32 = 0x01;
}

// ── SBR EEPROM ───────────────────────────────────────────────────────────────

/// SBR EEPROM bus addresses (7-bit).
pub mod eeprom {
    /// Default address.
    pub const ADDRESS_PRIMARY: u8 = 0x50;
    /// Address when `dcr::SBR_CONFIG_ALT_ADDRESS` is strapped.
    pub const ADDRESS_ALTERNATE: u8 = 0x54;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn offsets_unique_aligned_and_inside_window() {
        let mut seen = HashSet::new();
        for reg in Register::ALL {
            let off = reg.offset();
            assert_eq!(off % 4, 0, "{reg:?} misaligned");
            assert!(off + 4 <= BAR1_WINDOW_SIZE, "{reg:?} outside BAR1");
            assert!(seen.insert(off), "{reg:?} overlaps another register");
        }
    }

    #[test]
    fn register_sets_differ_only_in_diag_block() {
        let mpt = RegisterSet::Mpt;
        let mr = RegisterSet::MegaRaid;
        assert_eq!(mpt.host_diagnostic().offset(), 0x08);
        assert_eq!(mr.host_diagnostic().offset(), 0xf8);
        assert_eq!(mpt.write_sequence().offset(), 0x04);
        assert_eq!(mr.write_sequence().offset(), 0xfc);
        assert_eq!(mr.rw_data().offset(), 0x24);
        assert_eq!(mr.rw_address_low().offset(), 0x28);
        assert_eq!(mr.rw_address_high().offset(), 0x2c);
    }

    #[test]
    fn doorbell_flags_inside_state_mask() {
        for flag in [doorbell::READY, doorbell::OPERATIONAL, doorbell::FAULT] {
            assert_eq!(flag & doorbell::STATE_MASK, flag);
        }
    }

    #[test]
    fn window_is_one_huge_page() {
        assert_eq!(hcb::WINDOW_SIZE, 0x20_0000);
        assert_eq!(hcb::WINDOW_SIZE as u32 & !hcb::SIZE_MASK, 0);
    }
}
