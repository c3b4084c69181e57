//! Firmware personality detection and diagnostic unlock
//!
//! The diagnostic block sits at different offsets under MPT and MegaRAID
//! firmware, and is write-protected until the unlock key has been written
//! to the write-sequence register. Detection probes MPT first, then
//! MegaRAID:
//!
//! ```text
//! for set in [MPT, MegaRAID]:
//!     WRITE_ENABLE already set?      -> enable RW, done
//!     write unlock key, re-check     -> enable RW, done
//! neither                            -> locked (raw reads still work)
//! ```
//!
//! Run it again after every adapter reset: the personality can change.

use crate::error::{LsiError, Result};
use crate::mmio::RegisterIo;
use lsi_chip::regs::{diag, UNLOCK_KEY};
use lsi_chip::RegisterSet;

/// Outcome of one detection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDetection {
    /// Register set in use. When `unlocked` is false this is the last set
    /// probed, kept so raw register dumps still have offsets to use.
    pub register_set: RegisterSet,
    /// Whether diagnostic writes were unlocked.
    pub unlocked: bool,
}

impl ModeDetection {
    /// The register set, or [`LsiError::UnlockFailed`] if locked.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::UnlockFailed`] when neither personality unlocked.
    pub fn require_unlocked(&self) -> Result<RegisterSet> {
        if self.unlocked {
            Ok(self.register_set)
        } else {
            Err(LsiError::UnlockFailed)
        }
    }
}

impl std::fmt::Display for ModeDetection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.unlocked {
            write!(f, "{}", self.register_set)
        } else {
            write!(f, "locked (last probed {})", self.register_set)
        }
    }
}

/// Probe both personalities and unlock the first that accepts the key.
pub fn detect<R: RegisterIo + ?Sized>(regs: &mut R) -> ModeDetection {
    for set in RegisterSet::PROBE_ORDER {
        if enable_if_writable(regs, set) {
            tracing::info!("Device in {set} mode");
            return ModeDetection {
                register_set: set,
                unlocked: true,
            };
        }

        tracing::info!("Trying unlock in {set} mode...");
        write_unlock_key(regs, set);

        if enable_if_writable(regs, set) {
            tracing::info!("Device in {set} mode");
            return ModeDetection {
                register_set: set,
                unlocked: true,
            };
        }
    }

    tracing::warn!("Failed to unlock device; diagnostic register reads are unreliable");
    ModeDetection {
        register_set: RegisterSet::MegaRaid,
        unlocked: false,
    }
}

/// Write the six-byte unlock key to `set`'s write-sequence register.
pub fn write_unlock_key<R: RegisterIo + ?Sized>(regs: &mut R, set: RegisterSet) {
    for key in UNLOCK_KEY {
        regs.write32(set.write_sequence(), key);
    }
}

fn enable_if_writable<R: RegisterIo + ?Sized>(regs: &mut R, set: RegisterSet) -> bool {
    let value = regs.read32(set.host_diagnostic());
    if value & diag::WRITE_ENABLE == 0 {
        return false;
    }
    regs.write32(set.host_diagnostic(), value | diag::RW_ENABLE);
    true
}
