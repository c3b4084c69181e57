//! Error types for controller access

use std::path::PathBuf;
use thiserror::Error;

use crate::eeprom::SbrStep;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, LsiError>;

/// Errors that can occur while driving the controller
#[derive(Debug, Error)]
pub enum LsiError {
    /// BAR1 resource could not be opened or mapped
    #[error("Cannot map {path}: {reason}")]
    MappingFailed {
        /// Resource path that was attempted
        path: PathBuf,
        /// Reason for failure
        reason: String,
    },

    /// Neither personality accepted the unlock key
    #[error("Failed to unlock diagnostic interface")]
    UnlockFailed,

    /// SCL was never released or a self-clearing bit never cleared
    #[error("I2C timeout: {what}")]
    I2cTimeout {
        /// What was being waited for
        what: &'static str,
    },

    /// EEPROM did not acknowledge a protocol step
    #[error("EEPROM did not ACK {step} (offset {offset:#x})")]
    NoAck {
        /// Step that failed
        step: SbrStep,
        /// EEPROM offset being accessed
        offset: u16,
    },

    /// A file held fewer bytes than the fixed record size
    #[error("Expected {expected} bytes, got {actual}")]
    IoMismatch {
        /// Required length
        expected: usize,
        /// Length actually read or written
        actual: usize,
    },

    /// Doorbell never reported READY
    #[error("IOC not ready after {waited_ms}ms (doorbell {doorbell:#010x})")]
    IocNotReady {
        /// Last doorbell value
        doorbell: u32,
        /// Total wait in milliseconds
        waited_ms: u64,
    },

    /// IOC did not come up in the reset state after a forced-HCB reset
    #[error("IOC failed to halt (doorbell {doorbell:#010x})")]
    HaltFailed {
        /// Doorbell value observed
        doorbell: u32,
    },

    /// A sysfs control file write failed
    #[error("sysfs {path}: {source}")]
    Sysfs {
        /// File that was written
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Host-boot DMA window could not be set up
    #[error("DMA setup failed: {reason}")]
    Dma {
        /// Reason for failure
        reason: String,
    },

    /// Firmware image does not fit the host-boot window
    #[error("Firmware image is {size} bytes, window holds {max}")]
    FirmwareTooLarge {
        /// Image size
        size: usize,
        /// Window size
        max: usize,
    },

    /// PCI identifier is not of the form `DDDD:BB:DD.F`
    #[error("Invalid PCI ID: {id}")]
    InvalidPciId {
        /// Identifier supplied
        id: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl LsiError {
    /// Create a mapping failure error
    pub fn mapping_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MappingFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a DMA setup error
    pub fn dma(reason: impl Into<String>) -> Self {
        Self::Dma {
            reason: reason.into(),
        }
    }

    /// Create a sysfs error
    pub fn sysfs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Sysfs {
            path: path.into(),
            source,
        }
    }

    /// Whether the error leaves the card in an unknown state and the caller
    /// should suggest a reset before retrying.
    pub fn needs_reset(&self) -> bool {
        matches!(
            self,
            Self::IocNotReady { .. } | Self::HaltFailed { .. } | Self::Dma { .. }
        )
    }
}
