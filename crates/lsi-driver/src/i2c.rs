//! Bit-banged I2C master on the IOC's SBR pins
//!
//! SCL and SDA are open-drain: the pin register has a "drive low" bit and a
//! "read level" bit per line. Releasing a line means clearing its drive bit
//! and letting the pull-up (or a slave) decide the level.
//!
//! Every transition is followed by one half-period pause. Whenever the
//! master releases SCL it waits for the line to actually go high, so a slave
//! can stretch the clock; that wait is bounded by
//! [`Timing::scl_stretch_polls`].
//!
//! A stretch timeout is logged and returned as [`LsiError::I2cTimeout`],
//! but bit and byte primitives still finish their clock cycle first so the
//! bus is left in a defined phase. The SBR layer turns a timeout during an
//! ACK slot into a missing ACK.

use crate::bridge::{ChipConfig, ChipRegister};
use crate::config::Timing;
use crate::delay::Delay;
use crate::error::{LsiError, Result};
use crate::mmio::RegisterIo;
use lsi_chip::regs::chip;
use lsi_chip::RegisterSet;

/// Software I2C master over the chip-config pin register.
pub struct I2cMaster<'a, R: RegisterIo + ?Sized, D: Delay + ?Sized> {
    regs: &'a mut R,
    set: RegisterSet,
    delay: &'a mut D,
    timing: &'a Timing,
}

impl<'a, R: RegisterIo + ?Sized, D: Delay + ?Sized> I2cMaster<'a, R, D> {
    /// Master on the pins reached through `set`'s diagnostic bridge.
    pub fn new(regs: &'a mut R, set: RegisterSet, delay: &'a mut D, timing: &'a Timing) -> Self {
        Self {
            regs,
            set,
            delay,
            timing,
        }
    }

    fn pins(&mut self) -> ChipConfig<'_, R> {
        ChipConfig::new(&mut *self.regs, self.set)
    }

    fn pause(&mut self) {
        self.delay.delay(self.timing.i2c_half_period);
    }

    fn set_sda(&mut self, high: bool) {
        if high {
            self.pins().modify(ChipRegister::I2cPins, 0, chip::PIN_SDA_DRIVE);
        } else {
            self.pins().modify(ChipRegister::I2cPins, chip::PIN_SDA_DRIVE, 0);
        }
    }

    fn set_scl(&mut self, high: bool) {
        if high {
            self.pins().modify(ChipRegister::I2cPins, 0, chip::PIN_SCL_DRIVE);
        } else {
            self.pins().modify(ChipRegister::I2cPins, chip::PIN_SCL_DRIVE, 0);
        }
    }

    fn sda(&mut self) -> bool {
        self.pins().read32(ChipRegister::I2cPins) & chip::PIN_SDA_READ != 0
    }

    /// Wait for a released SCL to read high.
    fn wait_scl(&mut self) -> Result<()> {
        for _ in 0..self.timing.scl_stretch_polls {
            if self.pins().read32(ChipRegister::I2cPins) & chip::PIN_SCL_READ != 0 {
                return Ok(());
            }
            self.pause();
        }
        tracing::warn!("I2C: SCL timeout!");
        Err(LsiError::I2cTimeout {
            what: "SCL release (clock stretch)",
        })
    }

    /// START (or repeated START). On a stretch timeout no START is
    /// generated and the transaction must be abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::I2cTimeout`] if SCL never goes high.
    pub fn start(&mut self) -> Result<()> {
        self.pause();
        self.set_sda(true);
        self.pause();
        self.set_scl(true);
        self.pause();
        self.wait_scl()?;
        self.set_sda(false);
        self.pause();
        self.set_scl(false);
        self.pause();
        Ok(())
    }

    /// STOP.
    pub fn stop(&mut self) {
        self.pause();
        self.set_sda(false);
        self.pause();
        self.set_scl(true);
        self.pause();
        self.set_sda(true);
        self.pause();
    }

    /// Clock out one bit.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::I2cTimeout`] if SCL was held low; the clock is
    /// still pulled low again before returning.
    pub fn send_bit(&mut self, bit: bool) -> Result<()> {
        self.set_sda(bit);
        self.pause();
        self.set_scl(true);
        let stretched = self.wait_scl();
        self.pause();
        self.set_scl(false);
        self.pause();
        stretched
    }

    /// Clock in one bit. SDA is released first so the slave can drive it.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::I2cTimeout`] if SCL was held low.
    pub fn get_bit(&mut self) -> Result<bool> {
        self.set_sda(true);
        self.pause();
        self.set_scl(true);
        let stretched = self.wait_scl();
        self.pause();
        let level = self.sda();
        self.set_scl(false);
        self.pause();
        stretched.map(|()| level)
    }

    /// Clock out a byte, MSB first. All eight bits are sent even after a
    /// timeout; the first error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::I2cTimeout`] if any bit timed out.
    pub fn send_byte(&mut self, byte: u8) -> Result<()> {
        let mut outcome = Ok(());
        for shift in (0..8).rev() {
            let sent = self.send_bit(byte >> shift & 1 != 0);
            if outcome.is_ok() {
                outcome = sent;
            }
        }
        outcome
    }

    /// Clock in a byte, MSB first. Bits that timed out read as 0.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::I2cTimeout`] if any bit timed out.
    pub fn get_byte(&mut self) -> Result<u8> {
        let mut value = 0u8;
        let mut outcome = Ok(());
        for shift in (0..8).rev() {
            match self.get_bit() {
                Ok(true) => value |= 1 << shift,
                Ok(false) => {}
                Err(e) => {
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
            }
        }
        outcome.map(|()| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::RecordingDelay;
    use lsi_chip::Register;

    /// Pin register with a slave that records eight clocked bits and then
    /// drives them back on the next eight clocks.
    #[derive(Default)]
    struct LoopbackBus {
        address: u32,
        drive: u32,
        scl_stuck_low: bool,
        slave_low: bool,
        recorded: Vec<bool>,
        replayed: usize,
    }

    impl LoopbackBus {
        fn scl(&self) -> bool {
            self.drive & chip::PIN_SCL_DRIVE == 0 && !self.scl_stuck_low
        }

        fn sda(&self) -> bool {
            self.drive & chip::PIN_SDA_DRIVE == 0 && !self.slave_low
        }

        fn set_drive(&mut self, drive: u32) {
            let was_high = self.scl();
            self.drive = drive & (chip::PIN_SCL_DRIVE | chip::PIN_SDA_DRIVE);
            let is_high = self.scl();

            if !was_high && is_high && self.recorded.len() < 8 {
                let level = self.sda();
                self.recorded.push(level);
            }
            if was_high && !is_high && self.recorded.len() == 8 {
                if self.replayed < 8 {
                    self.slave_low = !self.recorded[self.replayed];
                    self.replayed += 1;
                } else {
                    self.slave_low = false;
                }
            }
        }
    }

    impl RegisterIo for LoopbackBus {
        fn read32(&self, reg: Register) -> u32 {
            if reg != Register::MptDiagRwData || self.address != chip::I2C_PINS {
                return 0;
            }
            let mut v = self.drive;
            if self.scl() {
                v |= chip::PIN_SCL_READ;
            }
            if self.sda() {
                v |= chip::PIN_SDA_READ;
            }
            v
        }

        fn write32(&mut self, reg: Register, value: u32) {
            match reg {
                Register::MptDiagRwAddressLow => self.address = value,
                Register::MptDiagRwData if self.address == chip::I2C_PINS => {
                    self.set_drive(value);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn loopback_returns_sent_byte() {
        let mut bus = LoopbackBus::default();
        let mut delay = RecordingDelay::new();
        let timing = Timing::default();
        let mut i2c = I2cMaster::new(&mut bus, RegisterSet::Mpt, &mut delay, &timing);

        i2c.start().unwrap();
        i2c.send_byte(0b1011_0010).unwrap();
        assert_eq!(i2c.get_byte().unwrap(), 0xb2);
        assert_eq!(
            bus.recorded,
            vec![true, false, true, true, false, false, true, false]
        );
    }

    #[test]
    fn stop_leaves_both_lines_released() {
        let mut bus = LoopbackBus::default();
        let mut delay = RecordingDelay::new();
        let timing = Timing::default();
        let mut i2c = I2cMaster::new(&mut bus, RegisterSet::Mpt, &mut delay, &timing);
        i2c.start().unwrap();
        assert_eq!(bus.drive, chip::PIN_SCL_DRIVE | chip::PIN_SDA_DRIVE);

        let mut i2c = I2cMaster::new(&mut bus, RegisterSet::Mpt, &mut delay, &timing);
        i2c.stop();
        assert_eq!(bus.drive, 0);
    }

    #[test]
    fn stuck_clock_times_out_start_without_hanging() {
        let mut bus = LoopbackBus {
            scl_stuck_low: true,
            ..LoopbackBus::default()
        };
        let mut delay = RecordingDelay::new();
        let timing = Timing::default();
        let mut i2c = I2cMaster::new(&mut bus, RegisterSet::Mpt, &mut delay, &timing);

        assert!(matches!(i2c.start(), Err(LsiError::I2cTimeout { .. })));
        // three transition pauses plus the bounded stretch wait
        assert_eq!(delay.calls(), 3 + u64::from(timing.scl_stretch_polls));
        assert!(delay.total() <= timing.i2c_half_period * (timing.scl_stretch_polls + 3));
        // SDA never pulled low: no START was generated
        assert_eq!(bus.drive & chip::PIN_SDA_DRIVE, 0);
    }

    #[test]
    fn stuck_clock_fails_bits_but_finishes_cycle() {
        let mut bus = LoopbackBus {
            scl_stuck_low: true,
            ..LoopbackBus::default()
        };
        let mut delay = RecordingDelay::new();
        let timing = Timing::default();
        let mut i2c = I2cMaster::new(&mut bus, RegisterSet::Mpt, &mut delay, &timing);

        assert!(i2c.send_bit(true).is_err());
        assert!(i2c.get_bit().is_err());
        assert!(i2c.send_byte(0xff).is_err());
        assert!(i2c.get_byte().is_err());
        assert_ne!(bus.drive & chip::PIN_SCL_DRIVE, 0, "SCL not pulled low again");
    }
}
