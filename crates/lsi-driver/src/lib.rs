//! Host-side recovery driver for LSI/Avago MPT2/MPT3 SAS controllers.
//!
//! Talks to the card through its BAR1 register window only. No kernel
//! driver, no firmware tools. Enough to get a bricked card talking again:
//! rewrite a corrupted Serial Boot Record, reset or halt the IOC, or boot
//! firmware straight from host memory when the flash is bad or empty.
//!
//! # Layers
//!
//! ```text
//! DeviceHandle ─┬─ eeprom::SbrBus ── i2c::I2cMaster ── bridge::ChipConfig ─┐
//!               │                                    bridge::DcrBridge ──┤
//!               └─ ioc::IocController ── dma / sysfs                     │
//!                                                                        ▼
//!            mode::detect ── mmio::RegisterIo (MmapRegion | sim::SimulatedIoc)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use lsi_driver::{config, DeviceHandle};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut dev = DeviceHandle::open(&config::sysfs_root(), "0000:01:00.0")?;
//! println!("{}", dev.info());
//!
//! let sbr = dev.read_sbr()?;
//! std::fs::write("sbr.bin", sbr)?;
//! # Ok(())
//! # }
//! ```
//!
//! Everything above [`mmio`] is generic over [`RegisterIo`] and
//! [`delay::Delay`], so the whole stack runs against [`sim::SimulatedIoc`]
//! in tests.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod bridge;
pub mod config;
pub mod delay;
mod device;
pub mod dma;
pub mod eeprom;
mod error;
pub mod i2c;
pub mod ioc;
pub mod mmio;
pub mod mode;
pub mod sim;
pub mod sysfs;

pub use device::{DeviceHandle, DeviceInfo};
pub use error::{LsiError, Result};
pub use ioc::DoorbellState;
pub use mmio::{MmapRegion, RegisterIo};
pub use mode::ModeDetection;
