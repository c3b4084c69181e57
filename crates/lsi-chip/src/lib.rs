//! Silicon model for LSI/Avago MPT2/MPT3-class SAS controllers (SAS2008,
//! SAS2308, SAS3008 and relatives).
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what the host sees through BAR1: register offsets for both
//! firmware personalities, Diagnostic/Doorbell bit definitions, the DCR and
//! chip-config addresses used to reach the SBR I2C bus, and the Serial Boot
//! Record byte layout.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | BAR1 register map, MPT/MegaRAID register sets, bit definitions |
//! | [`sbr`] | Serial Boot Record layout, checksums, text config round-trip |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod regs;
pub mod sbr;

pub use regs::{Register, RegisterSet};
pub use sbr::{SbrImage, SbrWarning, SBR_SIZE};
