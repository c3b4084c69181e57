//! Controller session
//!
//! [`DeviceHandle`] owns the BAR1 window for one run of the tool, the
//! current personality detection, and the SBR bus parameters once the bus
//! has been opened. Lifecycle operations update the detection in place,
//! since a reset can bring the card back under the other personality.

use std::fmt;
use std::path::Path;

use crate::bridge::{ChipConfig, ChipRegister, DcrBridge};
use crate::config::Timing;
use crate::delay::{Delay, StdDelay};
use crate::dma::DmaAllocator;
use crate::eeprom::{SbrBus, SbrConfig};
use crate::error::Result;
use crate::ioc::{DoorbellState, IocController};
use crate::mmio::{MmapRegion, RegisterIo};
use crate::mode::{self, ModeDetection};
use crate::sysfs::{validate_pci_id, PciControl};
use lsi_chip::regs::dcr;
use lsi_chip::{Register, SBR_SIZE};

/// Register snapshot printed by `info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Personality detection in effect.
    pub detection: ModeDetection,
    /// Raw doorbell.
    pub doorbell: u32,
    /// Host diagnostic register of the detected personality.
    pub host_diagnostic: u32,
    /// DCR `I2C_SELECT`.
    pub dcr_i2c_select: u32,
    /// DCR `SBR_CONFIG`.
    pub dcr_sbr_config: u32,
    /// Chip I2C pin register.
    pub chip_i2c_pins: u32,
    /// HCDW size register.
    pub hcb_size: u32,
    /// HCDW address, both halves.
    pub hcb_address: u64,
}

impl DeviceInfo {
    /// Decoded doorbell state.
    pub const fn state(&self) -> DoorbellState {
        DoorbellState::decode(self.doorbell)
    }

    /// SBR bus parameters implied by the strap register.
    pub const fn sbr_config(&self) -> SbrConfig {
        SbrConfig::from_dcr(self.dcr_sbr_config)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sbr = self.sbr_config();
        writeln!(f, "Mode:            {}", self.detection)?;
        writeln!(f, "IOC state:       {}", self.state())?;
        writeln!(
            f,
            "SBR EEPROM:      {:#04x}, {:?}",
            sbr.target_address, sbr.addressing_width
        )?;
        writeln!(f, "Registers:")?;
        writeln!(f, " DOORBELL:       {:#010x}", self.doorbell)?;
        writeln!(f, " DIAG:           {:#010x}", self.host_diagnostic)?;
        writeln!(f, " DCR_I2C_SELECT: {:#010x}", self.dcr_i2c_select)?;
        writeln!(f, " DCR_SBR_SELECT: {:#010x}", self.dcr_sbr_config)?;
        writeln!(f, " CHIP_I2C_PINS:  {:#010x}", self.chip_i2c_pins)?;
        writeln!(f, " HCB_SIZE:       {:#010x}", self.hcb_size)?;
        write!(f, " HCB_ADDR:       {:#018x}", self.hcb_address)
    }
}

/// One controller, mapped and mode-detected.
pub struct DeviceHandle<R: RegisterIo = MmapRegion, D: Delay = StdDelay> {
    regs: R,
    delay: D,
    timing: Timing,
    detection: ModeDetection,
    sbr_config: Option<SbrConfig>,
}

impl DeviceHandle {
    /// Map BAR1 of `pci_id` and detect its personality.
    ///
    /// A failed unlock is not an error here; it shows up in
    /// [`DeviceHandle::detection`] and in operations that need writes.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::InvalidPciId`](crate::LsiError::InvalidPciId) or
    /// [`LsiError::MappingFailed`](crate::LsiError::MappingFailed).
    pub fn open(sysfs_root: &Path, pci_id: &str) -> Result<Self> {
        validate_pci_id(pci_id)?;
        let regs = MmapRegion::open(sysfs_root, pci_id)?;
        Ok(Self::with_parts(regs, StdDelay, Timing::default()))
    }
}

impl<R: RegisterIo, D: Delay> DeviceHandle<R, D> {
    /// Session over an arbitrary register window.
    pub fn with_parts(mut regs: R, delay: D, timing: Timing) -> Self {
        let detection = mode::detect(&mut regs);
        Self {
            regs,
            delay,
            timing,
            detection,
            sbr_config: None,
        }
    }

    /// Run personality detection again.
    pub fn reopen(&mut self) -> ModeDetection {
        self.detection = mode::detect(&mut self.regs);
        self.detection
    }

    /// Current personality detection.
    pub const fn detection(&self) -> ModeDetection {
        self.detection
    }

    /// SBR bus parameters, once the bus has been opened.
    pub const fn sbr_config(&self) -> Option<SbrConfig> {
        self.sbr_config
    }

    /// Timing in use.
    pub const fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Delay source.
    pub const fn delay(&self) -> &D {
        &self.delay
    }

    /// Register window.
    pub const fn regs(&self) -> &R {
        &self.regs
    }

    /// Mutable register window.
    pub fn regs_mut(&mut self) -> &mut R {
        &mut self.regs
    }

    /// Snapshot of the interesting registers.
    pub fn info(&mut self) -> DeviceInfo {
        let set = self.detection.register_set;
        let mut dcr_bridge = DcrBridge::new(&mut self.regs);
        let dcr_i2c_select = dcr_bridge.read32(dcr::I2C_SELECT);
        let dcr_sbr_config = dcr_bridge.read32(dcr::SBR_CONFIG);
        let chip_i2c_pins = ChipConfig::new(&mut self.regs, set).read32(ChipRegister::I2cPins);

        DeviceInfo {
            detection: self.detection,
            doorbell: self.regs.read32(Register::Doorbell),
            host_diagnostic: self.regs.read32(set.host_diagnostic()),
            dcr_i2c_select,
            dcr_sbr_config,
            chip_i2c_pins,
            hcb_size: self.regs.read32(Register::HcbSize),
            hcb_address: u64::from(self.regs.read32(Register::HcbAddressHigh)) << 32
                | u64::from(self.regs.read32(Register::HcbAddressLow)),
        }
    }

    fn open_sbr(&mut self) -> Result<SbrBus<'_, R, D>> {
        let set = self.detection.require_unlocked()?;
        let bus = SbrBus::open(&mut self.regs, set, &mut self.delay, &self.timing)?;
        self.sbr_config = Some(bus.config());
        Ok(bus)
    }

    /// Read the 256-byte Serial Boot Record.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::UnlockFailed`](crate::LsiError::UnlockFailed) if
    /// the diagnostic bridge is locked, or any SBR protocol error.
    pub fn read_sbr(&mut self) -> Result<[u8; SBR_SIZE]> {
        let mut bus = self.open_sbr()?;
        let record = bus.read_record()?;
        bus.close()?;
        Ok(record)
    }

    /// Write the 256-byte Serial Boot Record, one byte at a time.
    ///
    /// # Errors
    ///
    /// As for [`DeviceHandle::read_sbr`]. A protocol error part way leaves
    /// the bytes before the failing offset written.
    pub fn write_sbr(&mut self, record: &[u8; SBR_SIZE]) -> Result<()> {
        let mut bus = self.open_sbr()?;
        bus.write_record(record)?;
        bus.close()
    }

    fn with_ioc<T>(
        &mut self,
        op: impl FnOnce(&mut IocController<'_, R, D>) -> Result<T>,
    ) -> Result<T> {
        let mut ioc = IocController::new(
            &mut self.regs,
            self.detection,
            &mut self.delay,
            &self.timing,
        );
        let result = op(&mut ioc);
        self.detection = ioc.detection();
        result
    }

    /// Reset the adapter; see [`IocController::reset`].
    ///
    /// # Errors
    ///
    /// See [`IocController::reset`].
    pub fn reset<P: PciControl + ?Sized>(&mut self, pci: &mut P) -> Result<DoorbellState> {
        self.with_ioc(|ioc| ioc.reset(pci))
    }

    /// Halt into host-control-bus mode; see [`IocController::halt`].
    ///
    /// # Errors
    ///
    /// See [`IocController::halt`].
    pub fn halt<P: PciControl + ?Sized>(&mut self, pci: &mut P) -> Result<()> {
        self.with_ioc(|ioc| ioc.halt(pci))
    }

    /// Boot `image` from host memory; see [`IocController::host_boot`].
    ///
    /// # Errors
    ///
    /// See [`IocController::host_boot`].
    pub fn host_boot<P, A>(&mut self, pci: &mut P, alloc: &mut A, image: &[u8]) -> Result<()>
    where
        P: PciControl + ?Sized,
        A: DmaAllocator + ?Sized,
    {
        self.with_ioc(|ioc| ioc.host_boot(pci, alloc, image))
    }
}
