//! Software model of the controller
//!
//! [`SimulatedIoc`] implements [`RegisterIo`] with enough behaviour to run
//! every driver path without hardware:
//!
//! - the unlock key on the personality's write-sequence register, with an
//!   optional personality switch on the next adapter reset
//! - the host diagnostic register: adapter reset, forced HCB halt and
//!   release from hold into a boot
//! - a doorbell that reports READY a scripted number of polls after a boot
//! - the DCR and chip-config spaces, including the self-clearing I2C reset
//! - a 24xx-style EEPROM on the bit-banged pins, with NACK injection
//!
//! [`SimDma`] and [`RecordingPci`] stand in for the DMA allocator and the
//! sysfs surface.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::dma::{DmaAllocator, DmaMemory};
use crate::eeprom::{AddressWidth, SbrStep};
use crate::error::{LsiError, Result};
use crate::mmio::RegisterIo;
use crate::sysfs::PciControl;
use lsi_chip::regs::{chip, dcr, diag, doorbell, hcb, UNLOCK_KEY};
use lsi_chip::{Register, RegisterSet, SBR_SIZE};

// ── EEPROM slave ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Receive { bits: u8, count: u8 },
    AckOut,
    Transmit { byte: u8, count: u8 },
    AckIn { acked: bool },
}

/// 24xx-style EEPROM answering on the SBR bus.
#[derive(Debug, Clone)]
pub struct SimEeprom {
    memory: Vec<u8>,
    address: u8,
    width: AddressWidth,
    phase: Phase,
    expect: SbrStep,
    reading: bool,
    pointer: u16,
    driving_low: bool,
    nack_on: Option<SbrStep>,
    received: Vec<(SbrStep, u8)>,
}

impl SimEeprom {
    /// Blank (0xff) part of `SBR_SIZE` bytes.
    pub fn new(address: u8, width: AddressWidth) -> Self {
        Self {
            memory: vec![0xff; SBR_SIZE],
            address,
            width,
            phase: Phase::Idle,
            expect: SbrStep::AddressWrite,
            reading: false,
            pointer: 0,
            driving_low: false,
            nack_on: None,
            received: Vec::new(),
        }
    }

    /// Stored bytes.
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Replace the stored bytes.
    pub fn load(&mut self, bytes: &[u8]) {
        self.memory[..bytes.len()].copy_from_slice(bytes);
    }

    /// Refuse to ACK every byte received at `step`.
    pub fn nack_on(&mut self, step: SbrStep) {
        self.nack_on = Some(step);
    }

    /// Every byte received, tagged with the step it was taken as.
    pub fn received(&self) -> &[(SbrStep, u8)] {
        &self.received
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.driving_low = false;
    }

    fn start(&mut self) {
        self.phase = Phase::Receive { bits: 0, count: 0 };
        self.expect = SbrStep::AddressWrite;
        self.driving_low = false;
    }

    fn stop(&mut self) {
        self.reset();
    }

    fn current(&self) -> u8 {
        self.memory[usize::from(self.pointer) % self.memory.len()]
    }

    fn rising(&mut self, sda: bool) {
        match &mut self.phase {
            Phase::Receive { bits, count } if *count < 8 => {
                *bits = *bits << 1 | u8::from(sda);
                *count += 1;
            }
            Phase::Transmit { count, .. } => *count += 1,
            Phase::AckIn { acked } => *acked = !sda,
            _ => {}
        }
    }

    fn falling(&mut self) {
        match self.phase {
            Phase::Receive { bits, count: 8 } => {
                if self.accept(bits) {
                    self.driving_low = true;
                    self.phase = Phase::AckOut;
                } else {
                    self.reset();
                }
            }
            Phase::AckOut => {
                self.driving_low = false;
                if self.reading {
                    self.begin_transmit();
                } else {
                    self.phase = Phase::Receive { bits: 0, count: 0 };
                }
            }
            Phase::Transmit { byte, count } => {
                if count == 8 {
                    self.driving_low = false;
                    self.phase = Phase::AckIn { acked: false };
                } else {
                    self.driving_low = byte << count & 0x80 == 0;
                }
            }
            Phase::AckIn { acked: true } => {
                self.pointer = self.pointer.wrapping_add(1);
                self.begin_transmit();
            }
            Phase::AckIn { acked: false } => self.reset(),
            _ => {}
        }
    }

    fn begin_transmit(&mut self) {
        let byte = self.current();
        self.driving_low = byte & 0x80 == 0;
        self.phase = Phase::Transmit { byte, count: 0 };
    }

    /// Take a complete byte; returns whether to ACK it.
    fn accept(&mut self, byte: u8) -> bool {
        let step = match self.expect {
            SbrStep::AddressWrite if byte & 1 == 1 => SbrStep::AddressRead,
            other => other,
        };
        self.received.push((step, byte));
        if self.nack_on == Some(step) {
            return false;
        }

        match step {
            SbrStep::AddressWrite | SbrStep::AddressRead => {
                if byte >> 1 != self.address {
                    return false;
                }
                self.reading = step == SbrStep::AddressRead;
                self.expect = match self.width {
                    AddressWidth::Addr16 => SbrStep::OffsetHigh,
                    AddressWidth::Addr8 => SbrStep::OffsetLow,
                };
            }
            SbrStep::OffsetHigh => {
                self.pointer = u16::from(byte) << 8;
                self.expect = SbrStep::OffsetLow;
            }
            SbrStep::OffsetLow => {
                self.pointer = match self.width {
                    AddressWidth::Addr16 => self.pointer & 0xff00 | u16::from(byte),
                    AddressWidth::Addr8 => u16::from(byte),
                };
                self.expect = SbrStep::Data;
            }
            SbrStep::Data => {
                let len = self.memory.len();
                self.memory[usize::from(self.pointer) % len] = byte;
                self.pointer = self.pointer.wrapping_add(1);
            }
        }
        true
    }
}

// ── Doorbell script ──────────────────────────────────────────────────────────

/// How the doorbell behaves after a boot starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellScript {
    /// READY on the given poll (1-based) after the boot started.
    ReadyAfter(u32),
    /// Never READY.
    Never,
}

/// Boot the model observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRecord {
    /// Boot device was the host window.
    pub from_hcdw: bool,
    /// `HcbSize` at boot time.
    pub hcb_size: u32,
    /// HCDW address at boot time.
    pub hcb_address: u64,
}

// ── Controller ───────────────────────────────────────────────────────────────

/// Register-level controller model.
#[derive(Debug)]
pub struct SimulatedIoc {
    personality: RegisterSet,
    next_personality: Option<RegisterSet>,
    unlockable: bool,
    honours_force_hcb: bool,
    locks_after_boot: bool,
    diag: u32,
    key_progress: usize,
    plain: HashMap<Register, u32>,
    dcr: HashMap<u32, u32>,
    chip: HashMap<u32, u32>,

    doorbell: Cell<u32>,
    script: DoorbellScript,
    booting: bool,
    polls: Cell<u32>,
    boots: Vec<BootRecord>,
    resets: u32,

    pins: u32,
    scl_stuck_low: bool,
    i2c_reset_busy: Cell<u32>,
    i2c_reset_stuck: bool,
    i2c_resets: u32,
    eeprom: SimEeprom,
}

impl SimulatedIoc {
    /// Running controller under `personality`, diagnostic writes locked,
    /// EEPROM at the primary address with 8-bit offsets.
    pub fn new(personality: RegisterSet) -> Self {
        let eeprom = SimEeprom::new(lsi_chip::regs::eeprom::ADDRESS_PRIMARY, AddressWidth::Addr8);
        Self {
            personality,
            next_personality: None,
            unlockable: true,
            honours_force_hcb: true,
            locks_after_boot: false,
            diag: 0,
            key_progress: 0,
            plain: HashMap::new(),
            dcr: HashMap::new(),
            chip: HashMap::new(),
            doorbell: Cell::new(doorbell::OPERATIONAL),
            script: DoorbellScript::ReadyAfter(3),
            booting: false,
            polls: Cell::new(0),
            boots: Vec::new(),
            resets: 0,
            pins: 0,
            scl_stuck_low: false,
            i2c_reset_busy: Cell::new(0),
            i2c_reset_stuck: false,
            i2c_resets: 0,
            eeprom,
        }
    }

    /// Start with diagnostic writes already enabled.
    #[must_use]
    pub fn unlocked(mut self) -> Self {
        self.diag |= diag::WRITE_ENABLE;
        self
    }

    /// Ignore the unlock key.
    #[must_use]
    pub fn unlockable(mut self, yes: bool) -> Self {
        self.unlockable = yes;
        self
    }

    /// Doorbell behaviour after boots.
    #[must_use]
    pub fn with_script(mut self, script: DoorbellScript) -> Self {
        self.script = script;
        self
    }

    /// Reset as a plain reset even when FORCE_HCB is set.
    #[must_use]
    pub fn ignoring_force_hcb(mut self) -> Self {
        self.honours_force_hcb = false;
        self
    }

    /// Drop diagnostic access for good once firmware boots out of halt.
    #[must_use]
    pub fn locking_after_boot(mut self) -> Self {
        self.locks_after_boot = true;
        self
    }

    /// Come back under `set` after the next adapter reset.
    #[must_use]
    pub fn switching_to(mut self, set: RegisterSet) -> Self {
        self.next_personality = Some(set);
        self
    }

    /// Replace the EEPROM and strap `SBR_CONFIG` to match it.
    #[must_use]
    pub fn with_eeprom(mut self, eeprom: SimEeprom) -> Self {
        let mut straps = 0;
        if eeprom.address == lsi_chip::regs::eeprom::ADDRESS_ALTERNATE {
            straps |= dcr::SBR_CONFIG_ALT_ADDRESS;
        }
        if eeprom.width == AddressWidth::Addr16 {
            straps |= dcr::SBR_CONFIG_WIDE_OFFSET;
        }
        self.dcr.insert(dcr::SBR_CONFIG, straps);
        self.eeprom = eeprom;
        self
    }

    /// Hold SCL low forever.
    #[must_use]
    pub fn with_stuck_clock(mut self) -> Self {
        self.scl_stuck_low = true;
        self
    }

    /// Never clear the I2C block reset.
    #[must_use]
    pub fn with_stuck_i2c_reset(mut self) -> Self {
        self.i2c_reset_stuck = true;
        self
    }

    /// Personality currently exposed.
    pub const fn personality(&self) -> RegisterSet {
        self.personality
    }

    /// Host diagnostic register value.
    pub const fn diag(&self) -> u32 {
        self.diag
    }

    /// EEPROM model.
    pub fn eeprom(&self) -> &SimEeprom {
        &self.eeprom
    }

    /// Mutable EEPROM model.
    pub fn eeprom_mut(&mut self) -> &mut SimEeprom {
        &mut self.eeprom
    }

    /// Boots observed so far.
    pub fn boots(&self) -> &[BootRecord] {
        &self.boots
    }

    /// Adapter resets observed so far.
    pub const fn resets(&self) -> u32 {
        self.resets
    }

    /// I2C block resets observed so far.
    pub const fn i2c_resets(&self) -> u32 {
        self.i2c_resets
    }

    /// Doorbell reads since the last boot started.
    pub fn doorbell_polls(&self) -> u32 {
        self.polls.get()
    }

    /// DCR value.
    pub fn dcr(&self, addr: u32) -> u32 {
        self.dcr.get(&addr).copied().unwrap_or(0)
    }

    fn stored(&self, reg: Register) -> u32 {
        self.plain.get(&reg).copied().unwrap_or(0)
    }

    fn rw_enabled(&self) -> bool {
        self.diag & (diag::WRITE_ENABLE | diag::RW_ENABLE)
            == diag::WRITE_ENABLE | diag::RW_ENABLE
    }

    fn routed(&self) -> bool {
        self.dcr(dcr::I2C_SELECT) & dcr::I2C_SELECT_HOST != 0
    }

    fn read_doorbell(&self) -> u32 {
        if self.booting {
            let polls = self.polls.get() + 1;
            self.polls.set(polls);
            if matches!(self.script, DoorbellScript::ReadyAfter(n) if polls >= n) {
                self.doorbell.set(doorbell::READY);
            }
        }
        self.doorbell.get()
    }

    fn write_key(&mut self, value: u32) {
        if !self.unlockable {
            return;
        }
        self.key_progress = if UNLOCK_KEY[self.key_progress] == value {
            self.key_progress + 1
        } else {
            usize::from(value == UNLOCK_KEY[0])
        };
        if self.key_progress == UNLOCK_KEY.len() {
            self.diag |= diag::WRITE_ENABLE;
            self.key_progress = 0;
        }
    }

    fn write_diag(&mut self, value: u32) {
        if self.diag & diag::WRITE_ENABLE == 0 {
            return;
        }
        let old = self.diag;
        let status = diag::WRITE_ENABLE | diag::HCB_MODE | diag::FLASH_BAD_SIG;
        let mut new = (value & !(status | diag::CLEAR_FLASH_BAD_SIG)) | (old & status);
        if value & diag::CLEAR_FLASH_BAD_SIG != 0 {
            new &= !diag::FLASH_BAD_SIG;
        }

        if new & diag::RESET_ADAPTER != 0 {
            self.adapter_reset(new);
            return;
        }
        if old & diag::HOLD_IOC_RESET != 0 && new & diag::HOLD_IOC_RESET == 0 {
            self.boot(new);
            new &= !diag::HCB_MODE;
            if self.locks_after_boot {
                self.unlockable = false;
                new &= !(diag::WRITE_ENABLE | diag::RW_ENABLE);
            }
        }
        self.diag = new;
    }

    fn adapter_reset(&mut self, value: u32) {
        self.resets += 1;
        if let Some(next) = self.next_personality.take() {
            self.personality = next;
        }
        self.key_progress = 0;
        self.doorbell.set(0);
        self.polls.set(0);

        let mut diag = (value & !(diag::RESET_ADAPTER | diag::WRITE_ENABLE | diag::RW_ENABLE))
            | diag::RESET_HISTORY;
        if self.honours_force_hcb && value & diag::FORCE_HCB_ON_RESET != 0 {
            diag |= diag::HCB_MODE | diag::HOLD_IOC_RESET;
            self.booting = false;
        } else {
            diag &= !diag::HCB_MODE;
            self.booting = true;
        }
        self.diag = diag;
    }

    fn boot(&mut self, diag: u32) {
        let hcb_address = u64::from(self.stored(Register::HcbAddressHigh)) << 32
            | u64::from(self.stored(Register::HcbAddressLow));
        self.boots.push(BootRecord {
            from_hcdw: diag & diag::BOOT_DEVICE_SELECT_MASK == diag::BOOT_DEVICE_HCDW,
            hcb_size: self.stored(Register::HcbSize),
            hcb_address,
        });
        self.doorbell.set(0);
        self.polls.set(0);
        self.booting = true;
    }

    fn chip_read(&self, addr: u32) -> u32 {
        match addr {
            chip::I2C_PINS => self.pin_levels(),
            chip::I2C_RESET => {
                let busy = self.i2c_reset_busy.get();
                if self.i2c_reset_stuck {
                    chip::I2C_RESET_ACTIVE
                } else if busy > 0 {
                    self.i2c_reset_busy.set(busy - 1);
                    chip::I2C_RESET_ACTIVE
                } else {
                    0
                }
            }
            _ => self.chip.get(&addr).copied().unwrap_or(0),
        }
    }

    fn chip_write(&mut self, addr: u32, value: u32) {
        match addr {
            chip::I2C_PINS => self.set_pins(value),
            chip::I2C_RESET if value & chip::I2C_RESET_ACTIVE != 0 => {
                self.i2c_resets += 1;
                self.i2c_reset_busy.set(2);
                self.eeprom.reset();
            }
            chip::I2C_RESET => {}
            _ => {
                self.chip.insert(addr, value);
            }
        }
    }

    fn scl(&self) -> bool {
        self.pins & chip::PIN_SCL_DRIVE == 0 && !self.scl_stuck_low
    }

    fn sda(&self) -> bool {
        self.pins & chip::PIN_SDA_DRIVE == 0 && !(self.routed() && self.eeprom.driving_low)
    }

    fn pin_levels(&self) -> u32 {
        let mut v = self.pins;
        if self.scl() {
            v |= chip::PIN_SCL_READ;
        }
        if self.sda() {
            v |= chip::PIN_SDA_READ;
        }
        v
    }

    fn set_pins(&mut self, value: u32) {
        let (scl0, sda0) = (self.scl(), self.sda());
        self.pins = value & (chip::PIN_SCL_DRIVE | chip::PIN_SDA_DRIVE);
        if !self.routed() {
            return;
        }
        let (scl1, sda1) = (self.scl(), self.sda());

        if scl0 && scl1 && sda0 != sda1 {
            if sda1 {
                self.eeprom.stop();
            } else {
                self.eeprom.start();
            }
        } else if !scl0 && scl1 {
            self.eeprom.rising(sda1);
        } else if scl0 && !scl1 {
            self.eeprom.falling();
        }
    }
}

impl RegisterIo for SimulatedIoc {
    fn read32(&self, reg: Register) -> u32 {
        let set = self.personality;
        match reg {
            Register::Doorbell => self.read_doorbell(),
            r if r == set.host_diagnostic() => self.diag,
            r if r == set.rw_data() => {
                if self.rw_enabled() {
                    self.chip_read(self.stored(set.rw_address_low()))
                } else {
                    0
                }
            }
            Register::DcrData => self.dcr(self.stored(Register::DcrAddress)),
            r => self.stored(r),
        }
    }

    fn write32(&mut self, reg: Register, value: u32) {
        let set = self.personality;
        match reg {
            r if r == set.write_sequence() => self.write_key(value),
            r if r == set.host_diagnostic() => self.write_diag(value),
            r if r == set.rw_data() => {
                if self.rw_enabled() {
                    self.chip_write(self.stored(set.rw_address_low()), value);
                }
            }
            Register::DcrData => {
                let addr = self.stored(Register::DcrAddress);
                self.dcr.insert(addr, value);
            }
            r => {
                self.plain.insert(r, value);
            }
        }
    }
}

// ── DMA ──────────────────────────────────────────────────────────────────────

/// Allocation bookkeeping shared between [`SimDma`] and its windows.
#[derive(Debug, Default)]
pub struct SimDmaState {
    /// Windows not yet dropped.
    pub live: usize,
    /// Windows handed out in total.
    pub allocations: usize,
    /// Contents of each window at the moment it was dropped.
    pub released: Vec<Vec<u8>>,
}

/// Heap-backed [`DmaAllocator`] with fake bus addresses above 4 GiB.
#[derive(Debug, Clone, Default)]
pub struct SimDma {
    state: Rc<RefCell<SimDmaState>>,
    fail: bool,
}

/// Base of the fake bus addresses.
pub const SIM_DMA_BASE: u64 = 0x1_2340_0000;

impl SimDma {
    /// Working allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose every allocation fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Shared bookkeeping.
    pub fn state(&self) -> std::cell::Ref<'_, SimDmaState> {
        self.state.borrow()
    }
}

/// Window handed out by [`SimDma`].
#[derive(Debug)]
pub struct SimDmaWindow {
    memory: Vec<u8>,
    physical: u64,
    state: Rc<RefCell<SimDmaState>>,
}

impl DmaAllocator for SimDma {
    type Memory = SimDmaWindow;

    fn allocate(&mut self, size: usize) -> Result<SimDmaWindow> {
        if self.fail {
            return Err(LsiError::dma("no huge pages"));
        }
        let mut state = self.state.borrow_mut();
        let physical = SIM_DMA_BASE + (state.allocations * hcb::WINDOW_SIZE) as u64;
        state.allocations += 1;
        state.live += 1;
        Ok(SimDmaWindow {
            memory: vec![0; size],
            physical,
            state: Rc::clone(&self.state),
        })
    }
}

impl DmaMemory for SimDmaWindow {
    fn physical_address(&self) -> u64 {
        self.physical
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn len(&self) -> usize {
        self.memory.len()
    }
}

impl Drop for SimDmaWindow {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.live -= 1;
        state.released.push(std::mem::take(&mut self.memory));
    }
}

// ── PCI ──────────────────────────────────────────────────────────────────────

/// [`PciControl`] that only records calls.
#[derive(Debug, Default)]
pub struct RecordingPci {
    /// Calls in order: `unbind`, `remove`, `rescan`, `bus_master`.
    pub calls: Vec<&'static str>,
}

impl PciControl for RecordingPci {
    fn unbind(&mut self) -> Result<()> {
        self.calls.push("unbind");
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        self.calls.push("remove");
        Ok(())
    }

    fn rescan(&mut self) -> Result<()> {
        self.calls.push("rescan");
        Ok(())
    }

    fn enable_bus_master(&mut self) -> Result<()> {
        self.calls.push("bus_master");
        Ok(())
    }
}
