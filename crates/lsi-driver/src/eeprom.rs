//! SBR EEPROM protocol
//!
//! The Serial Boot Record lives in a small 24xx-style EEPROM on the IOC's
//! private I2C bus. The bus address and offset width are strapped and can
//! be read back from DCR `SBR_CONFIG`. Host access needs the I2C block
//! reset and the pins routed to the host through DCR `I2C_SELECT`; the
//! [`SbrBus`] guard does both on open and undoes them on close or drop.
//!
//! Every protocol step checks the ACK bit and aborts on the first NACK.
//! Nothing is retried. A failed write may have updated every byte before
//! the failing one.

use std::fmt;

use crate::bridge::{ChipConfig, ChipRegister, DcrBridge};
use crate::config::Timing;
use crate::delay::Delay;
use crate::error::{LsiError, Result};
use crate::i2c::I2cMaster;
use crate::mmio::RegisterIo;
use lsi_chip::regs::{chip, dcr, eeprom};
use lsi_chip::{RegisterSet, SBR_SIZE};

/// EEPROM offset width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressWidth {
    /// One offset byte (24C02 and similar).
    Addr8,
    /// Two offset bytes, high first.
    Addr16,
}

impl AddressWidth {
    /// Offset bytes to send, tagged with the step each one represents.
    pub fn offset_steps(self, offset: u16) -> impl Iterator<Item = (SbrStep, u8)> {
        let [high, low] = offset.to_be_bytes();
        let high = (self == AddressWidth::Addr16).then_some((SbrStep::OffsetHigh, high));
        high.into_iter()
            .chain(std::iter::once((SbrStep::OffsetLow, low)))
    }
}

/// Bus parameters derived from DCR `SBR_CONFIG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbrConfig {
    /// 7-bit bus address.
    pub target_address: u8,
    /// Offset width.
    pub addressing_width: AddressWidth,
}

impl SbrConfig {
    /// Decode the strap bits.
    pub const fn from_dcr(value: u32) -> Self {
        let target_address = if value & dcr::SBR_CONFIG_ALT_ADDRESS != 0 {
            eeprom::ADDRESS_ALTERNATE
        } else {
            eeprom::ADDRESS_PRIMARY
        };
        let addressing_width = if value & dcr::SBR_CONFIG_WIDE_OFFSET != 0 {
            AddressWidth::Addr16
        } else {
            AddressWidth::Addr8
        };
        Self {
            target_address,
            addressing_width,
        }
    }

    const fn address_byte(self, read: bool) -> u8 {
        (self.target_address << 1) | read as u8
    }
}

/// Protocol step that can miss its ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbrStep {
    /// Bus address with the write bit.
    AddressWrite,
    /// High offset byte (16-bit parts only).
    OffsetHigh,
    /// Low offset byte.
    OffsetLow,
    /// Bus address with the read bit, after the repeated START.
    AddressRead,
    /// Data byte of a write.
    Data,
}

impl fmt::Display for SbrStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SbrStep::AddressWrite => "address W",
            SbrStep::OffsetHigh => "offset1",
            SbrStep::OffsetLow => "offset0",
            SbrStep::AddressRead => "address R",
            SbrStep::Data => "data",
        })
    }
}

/// Host-owned SBR bus. Hands the bus back to firmware when dropped.
pub struct SbrBus<'a, R: RegisterIo + ?Sized, D: Delay + ?Sized> {
    regs: &'a mut R,
    set: RegisterSet,
    delay: &'a mut D,
    timing: &'a Timing,
    config: SbrConfig,
    released: bool,
}

impl<'a, R: RegisterIo + ?Sized, D: Delay + ?Sized> SbrBus<'a, R, D> {
    /// Read the strap config, reset the I2C block, route the pins to the
    /// host and clock any stuck slave free.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::I2cTimeout`] if the I2C block reset never clears
    /// or the bus cannot generate a START.
    pub fn open(
        regs: &'a mut R,
        set: RegisterSet,
        delay: &'a mut D,
        timing: &'a Timing,
    ) -> Result<Self> {
        let config = SbrConfig::from_dcr(DcrBridge::new(&mut *regs).read32(dcr::SBR_CONFIG));
        tracing::info!("Using I2C address {:#04x}", config.target_address);
        tracing::info!("Using EEPROM type {:?}", config.addressing_width);

        pulse_i2c_reset(&mut *regs, set, &mut *delay, timing)?;
        DcrBridge::new(&mut *regs).modify(dcr::I2C_SELECT, dcr::I2C_SELECT_HOST, 0);

        let mut bus = Self {
            regs,
            set,
            delay,
            timing,
            config,
            released: false,
        };
        bus.resync()?;
        Ok(bus)
    }

    /// Bus parameters in use.
    pub const fn config(&self) -> SbrConfig {
        self.config
    }

    fn i2c(&mut self) -> I2cMaster<'_, R, D> {
        I2cMaster::new(&mut *self.regs, self.set, &mut *self.delay, self.timing)
    }

    /// Nine clocks with SDA released, then STOP/START/STOP.
    fn resync(&mut self) -> Result<()> {
        let mut i2c = self.i2c();
        for _ in 0..9 {
            // A stuck slave is the reason for this loop; timeouts are logged
            // by the master and the START below decides.
            let _ = i2c.send_bit(true);
        }
        i2c.stop();
        i2c.start()?;
        i2c.stop();
        Ok(())
    }

    /// Send a byte and require the slave's ACK.
    fn send_acked(&mut self, byte: u8, step: SbrStep, offset: u16) -> Result<()> {
        let mut i2c = self.i2c();
        let sent = i2c.send_byte(byte);
        let ack = i2c.get_bit();
        match (sent, ack) {
            (Ok(()), Ok(false)) => Ok(()),
            _ => Err(LsiError::NoAck { step, offset }),
        }
    }

    fn address_and_offset(&mut self, offset: u16) -> Result<()> {
        self.i2c().start()?;
        self.send_acked(self.config.address_byte(false), SbrStep::AddressWrite, offset)?;
        for (step, byte) in self.config.addressing_width.offset_steps(offset) {
            self.send_acked(byte, step, offset)?;
        }
        Ok(())
    }

    /// Sequential read of `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::NoAck`] naming the first step without ACK, or
    /// [`LsiError::I2cTimeout`] if the bus hung.
    pub fn read(&mut self, offset: u16, buf: &mut [u8]) -> Result<()> {
        let result = self.read_inner(offset, buf);
        if let Err(e) = &result {
            tracing::error!("SBR read failed: {e}");
            self.i2c().stop();
        }
        result
    }

    fn read_inner(&mut self, offset: u16, buf: &mut [u8]) -> Result<()> {
        self.address_and_offset(offset)?;

        self.i2c().start()?;
        self.send_acked(self.config.address_byte(true), SbrStep::AddressRead, offset)?;

        let last = buf.len().saturating_sub(1);
        let mut i2c = self.i2c();
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = i2c.get_byte()?;
            // NACK the final byte to end the transfer
            i2c.send_bit(i == last)?;
        }
        i2c.stop();
        Ok(())
    }

    /// Write `data` starting at `offset`, one byte per transaction, waiting
    /// out the EEPROM write cycle after each.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::NoAck`] naming the failing step and offset.
    /// Bytes before that offset have already been written.
    pub fn write(&mut self, offset: u16, data: &[u8]) -> Result<()> {
        for (i, byte) in data.iter().enumerate() {
            // Callers pass at most one record; offsets stay inside u16.
            #[allow(clippy::cast_possible_truncation)]
            let at = offset.wrapping_add(i as u16);
            if let Err(e) = self.write_byte(at, *byte) {
                tracing::error!("SBR write failed: {e}");
                self.i2c().stop();
                return Err(e);
            }
            self.delay.delay(self.timing.eeprom_write_cycle);
        }
        Ok(())
    }

    fn write_byte(&mut self, offset: u16, byte: u8) -> Result<()> {
        self.address_and_offset(offset)?;
        self.send_acked(byte, SbrStep::Data, offset)?;
        self.i2c().stop();
        tracing::trace!("SBR[{offset:#05x}] <- {byte:#04x}");
        Ok(())
    }

    /// Read the whole record.
    ///
    /// # Errors
    ///
    /// See [`SbrBus::read`].
    pub fn read_record(&mut self) -> Result<[u8; SBR_SIZE]> {
        let mut record = [0u8; SBR_SIZE];
        self.read(0, &mut record)?;
        Ok(record)
    }

    /// Write the whole record.
    ///
    /// # Errors
    ///
    /// See [`SbrBus::write`].
    pub fn write_record(&mut self, record: &[u8; SBR_SIZE]) -> Result<()> {
        self.write(0, record)
    }

    /// Reset the I2C block and hand the pins back to firmware.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::I2cTimeout`] if the block reset never clears.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        pulse_i2c_reset(&mut *self.regs, self.set, &mut *self.delay, self.timing)?;
        DcrBridge::new(&mut *self.regs).modify(dcr::I2C_SELECT, 0, dcr::I2C_SELECT_HOST);
        tracing::debug!("SBR bus returned to firmware");
        Ok(())
    }
}

impl<R: RegisterIo + ?Sized, D: Delay + ?Sized> Drop for SbrBus<'_, R, D> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!("Releasing SBR bus failed: {e}");
        }
    }
}

/// Pulse the I2C block reset and wait for it to self-clear.
fn pulse_i2c_reset<R: RegisterIo + ?Sized, D: Delay + ?Sized>(
    regs: &mut R,
    set: RegisterSet,
    delay: &mut D,
    timing: &Timing,
) -> Result<()> {
    let mut chip_cfg = ChipConfig::new(regs, set);
    chip_cfg.write32(ChipRegister::I2cReset, chip::I2C_RESET_ACTIVE);
    for _ in 0..timing.i2c_reset_polls {
        delay.delay(timing.i2c_half_period);
        if chip_cfg.read32(ChipRegister::I2cReset) & chip::I2C_RESET_ACTIVE == 0 {
            return Ok(());
        }
    }
    Err(LsiError::I2cTimeout {
        what: "I2C block reset",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dcr_straps_select_address_and_width() {
        assert_eq!(
            SbrConfig::from_dcr(0),
            SbrConfig {
                target_address: 0x50,
                addressing_width: AddressWidth::Addr8
            }
        );
        assert_eq!(
            SbrConfig::from_dcr(0x2 | 0x8),
            SbrConfig {
                target_address: 0x54,
                addressing_width: AddressWidth::Addr16
            }
        );
    }

    #[test]
    fn address_byte_carries_rw_bit() {
        let cfg = SbrConfig::from_dcr(0);
        assert_eq!(cfg.address_byte(false), 0xa0);
        assert_eq!(cfg.address_byte(true), 0xa1);
    }

    #[test]
    fn offset_encoding_per_width() {
        let narrow: Vec<_> = AddressWidth::Addr8.offset_steps(0x1234).collect();
        assert_eq!(narrow, vec![(SbrStep::OffsetLow, 0x34)]);

        let wide: Vec<_> = AddressWidth::Addr16.offset_steps(0x1234).collect();
        assert_eq!(
            wide,
            vec![(SbrStep::OffsetHigh, 0x12), (SbrStep::OffsetLow, 0x34)]
        );
    }
}
