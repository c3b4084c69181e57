//! `lsirec`: recovery tool for LSI/Avago MPT2/MPT3 SAS controllers.
//!
//! ```text
//! USAGE:
//!   lsirec <pci-id> info               Mode, IOC state and key registers
//!   lsirec <pci-id> readsbr <file>     Dump the 256-byte SBR to <file>
//!   lsirec <pci-id> writesbr <file>    Program the SBR from <file>
//!   lsirec <pci-id> reset              Reset the IOC and wait for READY
//!   lsirec <pci-id> halt               Hold the IOC in host-control-bus mode
//!   lsirec <pci-id> hostboot <file>    Boot firmware from host memory
//!   lsirec <pci-id> unbind             Detach the kernel driver
//!   lsirec <pci-id> rescan             Remove the device and rescan the bus
//! ```
//!
//! Must run as root with no kernel driver bound. `LSIREC_SYSFS_ROOT`
//! overrides `/sys`; `RUST_LOG` controls log output.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lsi_chip::regs::hcb;
use lsi_chip::SBR_SIZE;
use lsi_driver::config;
use lsi_driver::dma::HugePageAllocator;
use lsi_driver::sysfs::{PciControl, SysfsPci};
use lsi_driver::{DeviceHandle, LsiError, ModeDetection};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lsirec", about = "LSI SAS controller recovery tool", version)]
struct Cli {
    /// PCI ID of the controller (e.g. 0000:01:00.0).
    pci_id: String,
    #[command(subcommand)]
    op: Op,
}

#[derive(Debug, Subcommand)]
enum Op {
    /// Print mode, IOC state and register snapshot.
    Info,
    /// Read the Serial Boot Record into a file.
    #[command(name = "readsbr")]
    ReadSbr {
        /// Output file (256 bytes).
        file: PathBuf,
    },
    /// Write the Serial Boot Record from a file.
    #[command(name = "writesbr")]
    WriteSbr {
        /// Input file, at least 256 bytes. Bytes past the record are ignored.
        file: PathBuf,
    },
    /// Reset the IOC.
    Reset,
    /// Halt the IOC into host-control-bus mode.
    Halt,
    /// Boot a firmware image from host memory.
    #[command(name = "hostboot")]
    HostBoot {
        /// Firmware image, at most 2 MiB.
        file: PathBuf,
    },
    /// Unbind the kernel driver.
    Unbind,
    /// Remove the device and rescan the PCI bus.
    Rescan,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version land here too
            let _ = e.print();
            return ExitCode::from(usage_exit_code(&e));
        }
    };

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if e.downcast_ref::<LsiError>().is_some_and(LsiError::needs_reset) {
                eprintln!(
                    "The IOC may be in an unknown state; try `lsirec {} reset`.",
                    cli.pci_id
                );
            }
            ExitCode::FAILURE
        }
    }
}

/// Exit status for a parse error: 1 for usage errors, 0 for `--help`/`--version`.
fn usage_exit_code(e: &clap::Error) -> u8 {
    u8::from(e.use_stderr())
}

fn run(cli: &Cli) -> Result<()> {
    let root = config::sysfs_root();
    let id = cli.pci_id.as_str();

    match &cli.op {
        Op::Info => cmd_info(&root, id),
        Op::ReadSbr { file } => cmd_read_sbr(&root, id, file),
        Op::WriteSbr { file } => cmd_write_sbr(&root, id, file),
        Op::Reset => cmd_reset(&root, id),
        Op::Halt => cmd_halt(&root, id),
        Op::HostBoot { file } => cmd_host_boot(&root, id, file),
        Op::Unbind => cmd_unbind(&root, id),
        Op::Rescan => cmd_rescan(&root, id),
    }
}

fn open(root: &Path, id: &str) -> Result<DeviceHandle> {
    let dev = DeviceHandle::open(root, id)?;
    let detection = dev.detection();
    println!("{}", mode_banner(detection));
    if !detection.unlocked {
        tracing::warn!(%id, "diagnostic interface did not unlock");
    }
    Ok(dev)
}

fn mode_banner(detection: ModeDetection) -> String {
    if detection.unlocked {
        format!("Device in {} mode", detection.register_set)
    } else {
        format!("Device {detection}; register reads are unreliable")
    }
}

fn cmd_info(root: &Path, id: &str) -> Result<()> {
    let mut dev = open(root, id)?;
    println!("{}", dev.info());
    Ok(())
}

fn cmd_read_sbr(root: &Path, id: &str, file: &Path) -> Result<()> {
    let mut dev = open(root, id)?;
    let record = dev.read_sbr()?;
    fs::write(file, record).with_context(|| format!("writing {}", file.display()))?;
    println!("SBR saved to {}", file.display());
    Ok(())
}

fn cmd_write_sbr(root: &Path, id: &str, file: &Path) -> Result<()> {
    let record = load_sbr(file)?;
    let mut dev = open(root, id)?;
    dev.write_sbr(&record)?;
    println!("SBR written from {}", file.display());
    Ok(())
}

fn cmd_reset(root: &Path, id: &str) -> Result<()> {
    let mut pci = SysfsPci::new(root, id)?;
    let mut dev = open(root, id)?;
    println!("Resetting adapter ({})...", dev.detection());
    let state = dev.reset(&mut pci)?;
    println!("IOC is {state}");
    Ok(())
}

fn cmd_halt(root: &Path, id: &str) -> Result<()> {
    let mut pci = SysfsPci::new(root, id)?;
    let mut dev = open(root, id)?;
    dev.halt(&mut pci)?;
    println!("IOC halted");
    Ok(())
}

fn cmd_host_boot(root: &Path, id: &str, file: &Path) -> Result<()> {
    let image = load_firmware(file)?;
    let mut pci = SysfsPci::new(root, id)?;
    let mut dev = open(root, id)?;
    println!("Booting {} ({} bytes) from host memory...", file.display(), image.len());
    dev.host_boot(&mut pci, &mut HugePageAllocator::new(), &image)?;
    println!("IOC is {}", dev.info().state());
    Ok(())
}

fn cmd_unbind(root: &Path, id: &str) -> Result<()> {
    SysfsPci::new(root, id)?.unbind()?;
    println!("Driver unbound from {id}");
    Ok(())
}

fn cmd_rescan(root: &Path, id: &str) -> Result<()> {
    let mut pci = SysfsPci::new(root, id)?;
    pci.remove()?;
    pci.rescan()?;
    println!("Removed {id} and rescanned the bus");
    Ok(())
}

/// Read an SBR file. Only the first record's worth of bytes is used.
fn load_sbr(file: &Path) -> Result<[u8; SBR_SIZE]> {
    let bytes = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let record = bytes
        .get(..SBR_SIZE)
        .and_then(|head| <[u8; SBR_SIZE]>::try_from(head).ok())
        .ok_or(LsiError::IoMismatch {
            expected: SBR_SIZE,
            actual: bytes.len(),
        })?;
    Ok(record)
}

/// Read a firmware image that fits the host boot window.
fn load_firmware(file: &Path) -> Result<Vec<u8>> {
    let image = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    if image.len() > hcb::WINDOW_SIZE {
        return Err(LsiError::FirmwareTooLarge {
            size: image.len(),
            max: hcb::WINDOW_SIZE,
        }
        .into());
    }
    Ok(image)
}
