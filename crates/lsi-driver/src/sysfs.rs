//! PCI control surface over sysfs
//!
//! Driver unbind, device removal, bus rescan and bus-master enable are
//! plain writes to kernel pseudo-files. A missing control file means there
//! is nothing to do (no driver bound, device already removed) and counts as
//! success.

use crate::error::{LsiError, Result};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Offset of the 16-bit command register in PCI config space.
pub const PCI_COMMAND: u64 = 0x04;

/// Bus-master enable bit of the command register.
pub const PCI_COMMAND_MASTER: u16 = 0x0004;

/// Operations on the PCI function that the lifecycle controller needs.
pub trait PciControl {
    /// Detach the bound kernel driver, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::Sysfs`] if the write fails for any reason other
    /// than the file being absent.
    fn unbind(&mut self) -> Result<()>;

    /// Remove the function from the PCI core.
    ///
    /// # Errors
    ///
    /// As for [`PciControl::unbind`].
    fn remove(&mut self) -> Result<()>;

    /// Rescan the whole PCI bus.
    ///
    /// # Errors
    ///
    /// As for [`PciControl::unbind`].
    fn rescan(&mut self) -> Result<()>;

    /// Let the function master the bus so it can DMA from host memory.
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::Sysfs`] if config space cannot be read or written.
    fn enable_bus_master(&mut self) -> Result<()>;
}

impl<P: PciControl + ?Sized> PciControl for &mut P {
    fn unbind(&mut self) -> Result<()> {
        (**self).unbind()
    }

    fn remove(&mut self) -> Result<()> {
        (**self).remove()
    }

    fn rescan(&mut self) -> Result<()> {
        (**self).rescan()
    }

    fn enable_bus_master(&mut self) -> Result<()> {
        (**self).enable_bus_master()
    }
}

/// Check a PCI identifier has the `DDDD:BB:DD.F` form.
///
/// # Errors
///
/// Returns [`LsiError::InvalidPciId`] otherwise.
pub fn validate_pci_id(id: &str) -> Result<()> {
    let invalid = || LsiError::InvalidPciId { id: id.to_owned() };
    if id.len() > 16 {
        return Err(invalid());
    }

    let hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
    let mut parts = id.split(':');
    let (Some(domain), Some(bus), Some(slot), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    let Some((device, function)) = slot.split_once('.') else {
        return Err(invalid());
    };

    let function_ok = function.len() == 1 && matches!(function.as_bytes()[0], b'0'..=b'7');
    if hex(domain, 4) && hex(bus, 2) && hex(device, 2) && function_ok {
        Ok(())
    } else {
        Err(invalid())
    }
}

/// sysfs-backed [`PciControl`] for one function.
#[derive(Debug, Clone)]
pub struct SysfsPci {
    root: PathBuf,
    pci_id: String,
}

impl SysfsPci {
    /// Control surface for `pci_id` under `root` (normally `/sys`).
    ///
    /// # Errors
    ///
    /// Returns [`LsiError::InvalidPciId`] for a malformed identifier.
    pub fn new(root: impl Into<PathBuf>, pci_id: &str) -> Result<Self> {
        validate_pci_id(pci_id)?;
        Ok(Self {
            root: root.into(),
            pci_id: pci_id.to_owned(),
        })
    }

    /// sysfs directory of the function.
    pub fn device_dir(&self) -> PathBuf {
        self.root.join("bus/pci/devices").join(&self.pci_id)
    }

    fn write_control(&self, path: &Path, token: &str) -> Result<()> {
        let opened = OpenOptions::new().write(true).open(path);
        let written = opened.and_then(|mut f| f.write_all(token.as_bytes()));
        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("{} absent, nothing to do", path.display());
                Ok(())
            }
            Err(e) => Err(LsiError::sysfs(path, e)),
        }
    }
}

impl PciControl for SysfsPci {
    fn unbind(&mut self) -> Result<()> {
        let path = self.device_dir().join("driver/unbind");
        tracing::info!("Unbinding kernel driver from {}", self.pci_id);
        self.write_control(&path, &self.pci_id)
    }

    fn remove(&mut self) -> Result<()> {
        let path = self.device_dir().join("remove");
        tracing::info!("Removing {}", self.pci_id);
        self.write_control(&path, "1")
    }

    fn rescan(&mut self) -> Result<()> {
        let path = self.root.join("bus/pci/rescan");
        tracing::info!("Rescanning PCI bus");
        self.write_control(&path, "1")
    }

    fn enable_bus_master(&mut self) -> Result<()> {
        let path = self.device_dir().join("config");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| LsiError::sysfs(&path, e))?;

        let mut cmd = [0u8; 2];
        file.read_exact_at(&mut cmd, PCI_COMMAND)
            .map_err(|e| LsiError::sysfs(&path, e))?;
        let before = u16::from_le_bytes(cmd);
        let after = before | PCI_COMMAND_MASTER;
        file.write_all_at(&after.to_le_bytes(), PCI_COMMAND)
            .map_err(|e| LsiError::sysfs(&path, e))?;

        tracing::debug!("PCI command {before:#06x} -> {after:#06x}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0000:01:00.0";

    fn fake_sysfs() -> (tempfile::TempDir, SysfsPci) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bus/pci/devices").join(ID)).unwrap();
        let pci = SysfsPci::new(dir.path(), ID).unwrap();
        (dir, pci)
    }

    #[test]
    fn pci_id_shape() {
        assert!(validate_pci_id("0000:01:00.0").is_ok());
        assert!(validate_pci_id("abcd:ef:1f.7").is_ok());
        for bad in [
            "",
            "01:00.0",
            "0000:01:00",
            "0000:01:00.8",
            "0000:01:00.0:1",
            "../../../etc/x",
            "0000:01:00.0000000",
            "000g:01:00.0",
        ] {
            assert!(
                matches!(validate_pci_id(bad), Err(LsiError::InvalidPciId { .. })),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn unbind_without_driver_is_success() {
        let (_dir, mut pci) = fake_sysfs();
        pci.unbind().unwrap();
        assert!(!pci.device_dir().join("driver").exists());
    }

    #[test]
    fn unbind_writes_pci_id() {
        let (_dir, mut pci) = fake_sysfs();
        let driver = pci.device_dir().join("driver");
        std::fs::create_dir(&driver).unwrap();
        std::fs::write(driver.join("unbind"), "").unwrap();

        pci.unbind().unwrap();
        assert_eq!(std::fs::read_to_string(driver.join("unbind")).unwrap(), ID);
    }

    #[test]
    fn remove_and_rescan_write_one() {
        let (dir, mut pci) = fake_sysfs();
        std::fs::write(pci.device_dir().join("remove"), "").unwrap();
        std::fs::write(dir.path().join("bus/pci/rescan"), "").unwrap();

        pci.remove().unwrap();
        pci.rescan().unwrap();
        assert_eq!(
            std::fs::read_to_string(pci.device_dir().join("remove")).unwrap(),
            "1"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("bus/pci/rescan")).unwrap(),
            "1"
        );
    }

    #[test]
    fn other_failures_are_errors() {
        let (_dir, mut pci) = fake_sysfs();
        // a directory where the control file should be: EISDIR, not ENOENT
        std::fs::create_dir(pci.device_dir().join("remove")).unwrap();
        assert!(matches!(pci.remove(), Err(LsiError::Sysfs { .. })));
    }

    #[test]
    fn bus_master_bit_set_in_command_register() {
        let (_dir, mut pci) = fake_sysfs();
        let config = pci.device_dir().join("config");
        let mut space = vec![0u8; 64];
        space[4] = 0x02;
        std::fs::write(&config, &space).unwrap();

        pci.enable_bus_master().unwrap();
        let space = std::fs::read(&config).unwrap();
        assert_eq!(u16::from_le_bytes([space[4], space[5]]), 0x0006);
        assert_eq!(space.len(), 64);
    }

    #[test]
    fn bus_master_needs_config_space() {
        let (_dir, mut pci) = fake_sysfs();
        assert!(matches!(
            pci.enable_bus_master(),
            Err(LsiError::Sysfs { .. })
        ));
    }
}
