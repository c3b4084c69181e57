//! Indirect address/data bridges
//!
//! Three windows into address spaces that are not directly mapped:
//!
//! - **Diagnostic**: 64-bit address split over the personality's
//!   `DiagRwAddressHigh`/`DiagRwAddressLow`, data through `DiagRwData`.
//!   Only works once diagnostic R/W is enabled (see [`crate::mode`]).
//! - **DCR**: one address register, one data register, fixed offsets.
//! - **Chip-config**: named SoC registers reached through the diagnostic
//!   bridge.
//!
//! None of them lock. Callers must not interleave two bridge accesses; the
//! `&mut` borrow of the register window enforces that inside one process.

use crate::mmio::RegisterIo;
use lsi_chip::regs::chip;
use lsi_chip::{Register, RegisterSet};

/// Diagnostic indirect bridge for one register set.
pub struct DiagBridge<'a, R: RegisterIo + ?Sized> {
    regs: &'a mut R,
    set: RegisterSet,
}

impl<'a, R: RegisterIo + ?Sized> DiagBridge<'a, R> {
    /// Bridge through `set`'s diagnostic registers.
    pub fn new(regs: &'a mut R, set: RegisterSet) -> Self {
        Self { regs, set }
    }

    fn select(&mut self, addr: u32) {
        self.regs.write32(self.set.rw_address_high(), 0);
        self.regs.write32(self.set.rw_address_low(), addr);
    }

    /// Read the 32-bit word at chip address `addr`.
    pub fn read32(&mut self, addr: u32) -> u32 {
        self.select(addr);
        self.regs.read32(self.set.rw_data())
    }

    /// Write the 32-bit word at chip address `addr`.
    pub fn write32(&mut self, addr: u32, value: u32) {
        self.select(addr);
        self.regs.write32(self.set.rw_data(), value);
    }
}

/// Deep Control Register bridge.
pub struct DcrBridge<'a, R: RegisterIo + ?Sized> {
    regs: &'a mut R,
}

impl<'a, R: RegisterIo + ?Sized> DcrBridge<'a, R> {
    /// Bridge through the DCR address/data pair.
    pub fn new(regs: &'a mut R) -> Self {
        Self { regs }
    }

    /// Read DCR `addr`.
    pub fn read32(&mut self, addr: u32) -> u32 {
        self.regs.write32(Register::DcrAddress, addr);
        self.regs.read32(Register::DcrData)
    }

    /// Write DCR `addr`.
    pub fn write32(&mut self, addr: u32, value: u32) {
        self.regs.write32(Register::DcrAddress, addr);
        self.regs.write32(Register::DcrData, value);
    }

    /// Read-modify-write: set `set`, then clear `clear`.
    pub fn modify(&mut self, addr: u32, set: u32, clear: u32) -> u32 {
        let value = (self.read32(addr) | set) & !clear;
        self.write32(addr, value);
        value
    }
}

/// SoC registers reachable through the chip-config window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipRegister {
    /// Raw SCL/SDA pin register.
    I2cPins,
    /// I2C block reset.
    I2cReset,
}

impl ChipRegister {
    /// Chip-space address.
    pub const fn address(self) -> u32 {
        match self {
            ChipRegister::I2cPins => chip::I2C_PINS,
            ChipRegister::I2cReset => chip::I2C_RESET,
        }
    }
}

/// Chip-config bridge (named registers over the diagnostic bridge).
pub struct ChipConfig<'a, R: RegisterIo + ?Sized> {
    diag: DiagBridge<'a, R>,
}

impl<'a, R: RegisterIo + ?Sized> ChipConfig<'a, R> {
    /// Chip-config access through `set`'s diagnostic bridge.
    pub fn new(regs: &'a mut R, set: RegisterSet) -> Self {
        Self {
            diag: DiagBridge::new(regs, set),
        }
    }

    /// Read a chip register.
    pub fn read32(&mut self, reg: ChipRegister) -> u32 {
        self.diag.read32(reg.address())
    }

    /// Write a chip register.
    pub fn write32(&mut self, reg: ChipRegister, value: u32) {
        self.diag.write32(reg.address(), value);
    }

    /// Read-modify-write: set `set`, then clear `clear`.
    pub fn modify(&mut self, reg: ChipRegister, set: u32, clear: u32) {
        let value = (self.read32(reg) | set) & !clear;
        self.write32(reg, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Records every register access in order.
    #[derive(Default)]
    struct Trace {
        log: RefCell<Vec<(char, Register, u32)>>,
        values: HashMap<Register, u32>,
    }

    impl RegisterIo for Trace {
        fn read32(&self, reg: Register) -> u32 {
            let v = self.values.get(&reg).copied().unwrap_or(0);
            self.log.borrow_mut().push(('r', reg, v));
            v
        }

        fn write32(&mut self, reg: Register, value: u32) {
            self.log.borrow_mut().push(('w', reg, value));
            self.values.insert(reg, value);
        }
    }

    #[test]
    fn diag_read_writes_high_then_low_then_reads_data() {
        let mut t = Trace::default();
        t.values.insert(Register::MrDiagRwData, 0xdead_beef);
        let v = DiagBridge::new(&mut t, RegisterSet::MegaRaid).read32(0xc210_0020);
        assert_eq!(v, 0xdead_beef);
        assert_eq!(
            t.log.into_inner(),
            vec![
                ('w', Register::MrDiagRwAddressHigh, 0),
                ('w', Register::MrDiagRwAddressLow, 0xc210_0020),
                ('r', Register::MrDiagRwData, 0xdead_beef),
            ]
        );
    }

    #[test]
    fn dcr_uses_single_address_register() {
        let mut t = Trace::default();
        DcrBridge::new(&mut t).write32(0x307, 0x80_0000);
        assert_eq!(
            t.log.into_inner(),
            vec![
                ('w', Register::DcrAddress, 0x307),
                ('w', Register::DcrData, 0x80_0000),
            ]
        );
    }

    #[test]
    fn chip_config_modify_goes_through_mpt_diag() {
        let mut t = Trace::default();
        t.values.insert(Register::MptDiagRwData, 0x0c);
        ChipConfig::new(&mut t, RegisterSet::Mpt).modify(ChipRegister::I2cPins, 0, 0x08);
        assert_eq!(t.values[&Register::MptDiagRwData], 0x04);
        assert_eq!(t.values[&Register::MptDiagRwAddressLow], chip::I2C_PINS);
    }
}
