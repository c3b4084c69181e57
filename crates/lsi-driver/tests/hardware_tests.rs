//! Tests against a real controller
//!
//! Set `LSIREC_TEST_PCI_ID` to the card's PCI ID and run as root with
//! `--ignored`. Only non-destructive operations are exercised.

use lsi_driver::{config, DeviceHandle};

fn pci_id() -> String {
    std::env::var("LSIREC_TEST_PCI_ID").unwrap_or_else(|_| "0000:01:00.0".into())
}

#[test]
#[ignore] // Requires hardware
fn test_open_and_unlock() {
    let mut dev = DeviceHandle::open(&config::sysfs_root(), &pci_id()).expect("map BAR1");
    assert!(dev.detection().unlocked, "diagnostic unlock failed");
    println!("{}", dev.info());
}

#[test]
#[ignore] // Requires hardware
fn test_sbr_reads_are_stable() {
    let mut dev = DeviceHandle::open(&config::sysfs_root(), &pci_id()).expect("map BAR1");
    let first = dev.read_sbr().expect("first SBR read");
    let second = dev.read_sbr().expect("second SBR read");
    assert_eq!(first, second, "SBR contents changed between reads");

    let (image, warnings) = lsi_chip::SbrImage::parse(&first).expect("parse SBR");
    for w in &warnings {
        println!("warning: {w}");
    }
    println!("{}", image.to_config());
}
