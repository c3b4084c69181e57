//! Timing configuration
//!
//! All waits in the driver are bounded polls or fixed sleeps. The values
//! here are the ones the hardware needs; tests keep them and swap the
//! [`Delay`](crate::delay::Delay) implementation instead.

use std::time::Duration;

/// Environment variable overriding the sysfs mount point.
pub const SYSFS_ROOT_ENV: &str = "LSIREC_SYSFS_ROOT";

/// Default sysfs mount point.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Bus timing and poll limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Pause between I2C pin transitions
    pub i2c_half_period: Duration,
    /// Polls of SCL before a clock-stretch timeout
    pub scl_stretch_polls: u32,
    /// Polls of the I2C block reset bit before giving up
    pub i2c_reset_polls: u32,
    /// EEPROM internal write cycle after each byte
    pub eeprom_write_cycle: Duration,
    /// Settle time around the adapter reset bit
    pub reset_settle: Duration,
    /// Doorbell polls while waiting for READY
    pub ready_polls: u32,
    /// Interval between doorbell polls
    pub ready_interval: Duration,
    /// Wait after a forced-HCB reset
    pub halt_settle: Duration,
    /// Wait after the host-booted IOC reports READY
    pub boot_settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            i2c_half_period: Duration::from_micros(5),
            scl_stretch_polls: 100,
            i2c_reset_polls: 1_000,
            eeprom_write_cycle: Duration::from_millis(5),
            reset_settle: Duration::from_millis(100),
            ready_polls: 200,
            ready_interval: Duration::from_millis(10),
            halt_settle: Duration::from_secs(1),
            boot_settle: Duration::from_millis(500),
        }
    }
}

impl Timing {
    /// Longest the READY poll can take.
    pub fn ready_timeout(&self) -> Duration {
        self.ready_interval * self.ready_polls
    }
}

/// Sysfs root, honouring [`SYSFS_ROOT_ENV`].
pub fn sysfs_root() -> std::path::PathBuf {
    std::env::var_os(SYSFS_ROOT_ENV)
        .map_or_else(|| DEFAULT_SYSFS_ROOT.into(), std::path::PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hardware_timing() {
        let t = Timing::default();
        assert_eq!(t.i2c_half_period, Duration::from_micros(5));
        assert_eq!(t.scl_stretch_polls, 100);
        assert_eq!(t.ready_timeout(), Duration::from_secs(2));
        assert_eq!(t.boot_settle, Duration::from_millis(500));
    }
}
