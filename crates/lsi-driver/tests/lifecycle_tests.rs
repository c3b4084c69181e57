//! Reset, halt and host boot against the simulated controller

use lsi_chip::regs::{diag, hcb};
use lsi_chip::{Register, RegisterSet};
use lsi_driver::config::Timing;
use lsi_driver::delay::RecordingDelay;
use lsi_driver::sim::{DoorbellScript, RecordingPci, SimDma, SimulatedIoc, SIM_DMA_BASE};
use lsi_driver::sysfs::SysfsPci;
use lsi_driver::{DeviceHandle, DoorbellState, LsiError, RegisterIo};

fn handle(sim: SimulatedIoc) -> DeviceHandle<SimulatedIoc, RecordingDelay> {
    DeviceHandle::with_parts(sim, RecordingDelay::new(), Timing::default())
}

fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ── Reset ────────────────────────────────────────────────────────────────────

#[test]
fn reset_succeeds_when_ready_within_three_polls() {
    let sim = SimulatedIoc::new(RegisterSet::Mpt).with_script(DoorbellScript::ReadyAfter(3));
    let mut dev = handle(sim);
    let mut pci = RecordingPci::default();

    let state = dev.reset(&mut pci).unwrap();
    assert!(state.contains(DoorbellState::READY));
    assert_eq!(dev.regs().doorbell_polls(), 3);
    assert_eq!(dev.regs().resets(), 1);
    assert_eq!(pci.calls, vec!["unbind"]);
    assert!(dev.detection().unlocked, "not re-unlocked after reset");
}

#[test]
fn reset_times_out_after_two_hundred_polls() {
    let mut dev = handle(SimulatedIoc::new(RegisterSet::Mpt).with_script(DoorbellScript::Never));
    let mut pci = RecordingPci::default();

    let err = dev.reset(&mut pci).unwrap_err();
    assert!(
        matches!(
            err,
            LsiError::IocNotReady {
                doorbell: 0,
                waited_ms: 2000
            }
        ),
        "{err}"
    );
    assert!(err.needs_reset());
    assert_eq!(dev.regs().doorbell_polls(), 200);
}

#[test]
fn reset_clears_boot_select_and_hcb() {
    let mut sim = SimulatedIoc::new(RegisterSet::Mpt).unlocked();
    sim.write32(
        Register::MptHostDiagnostic,
        diag::BOOT_DEVICE_HCDW | diag::FORCE_HCB_ON_RESET,
    );
    let mut dev = handle(sim);
    dev.reset(&mut RecordingPci::default()).unwrap();

    let d = dev.regs().diag();
    assert_eq!(d & diag::BOOT_DEVICE_SELECT_MASK, 0);
    assert_eq!(d & (diag::FORCE_HCB_ON_RESET | diag::HCB_MODE), 0);
    assert_ne!(d & diag::RESET_HISTORY, 0);
}

#[test]
fn reset_follows_personality_change() {
    let sim = SimulatedIoc::new(RegisterSet::Mpt).switching_to(RegisterSet::MegaRaid);
    let mut dev = handle(sim);
    assert_eq!(dev.detection().register_set, RegisterSet::Mpt);

    dev.reset(&mut RecordingPci::default()).unwrap();
    assert_eq!(dev.detection().register_set, RegisterSet::MegaRaid);
    assert!(dev.detection().unlocked);
}

#[test]
fn reset_needs_unlocked_diagnostics() {
    let mut dev = handle(SimulatedIoc::new(RegisterSet::Mpt).unlockable(false));
    let mut pci = RecordingPci::default();
    assert!(matches!(dev.reset(&mut pci), Err(LsiError::UnlockFailed)));
    assert!(pci.calls.is_empty());
    assert_eq!(dev.regs().resets(), 0);
}

#[test]
fn reset_with_unbound_sysfs_device() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("bus/pci/devices/0000:01:00.0")).unwrap();
    let mut pci = SysfsPci::new(dir.path(), "0000:01:00.0").unwrap();

    let mut dev = handle(SimulatedIoc::new(RegisterSet::Mpt));
    dev.reset(&mut pci).unwrap();
}

// ── Halt ─────────────────────────────────────────────────────────────────────

#[test]
fn halt_leaves_ioc_held_in_reset() {
    let mut dev = handle(SimulatedIoc::new(RegisterSet::Mpt));
    let mut pci = RecordingPci::default();

    dev.halt(&mut pci).unwrap();
    let d = dev.regs().diag();
    assert_ne!(d & diag::HOLD_IOC_RESET, 0);
    assert_ne!(d & diag::HCB_MODE, 0);
    assert_eq!(d & diag::FORCE_HCB_ON_RESET, 0);
    assert!(dev.detection().unlocked);
    assert_eq!(pci.calls, vec!["unbind"]);
}

#[test]
fn halt_fails_when_firmware_boots_anyway() {
    let sim = SimulatedIoc::new(RegisterSet::Mpt)
        .ignoring_force_hcb()
        .with_script(DoorbellScript::ReadyAfter(1));
    let mut dev = handle(sim);

    let err = dev.halt(&mut RecordingPci::default()).unwrap_err();
    assert!(matches!(err, LsiError::HaltFailed { doorbell: 0x1000_0000 }), "{err}");
}

// ── Host boot ────────────────────────────────────────────────────────────────

#[test]
fn host_boot_places_image_at_window_tail() {
    let mut dev = handle(SimulatedIoc::new(RegisterSet::Mpt));
    let mut pci = RecordingPci::default();
    let mut dma = SimDma::new();
    let image = firmware(300_000);

    dev.host_boot(&mut pci, &mut dma, &image).unwrap();

    let state = dma.state();
    assert_eq!(state.live, 0, "DMA window leaked");
    let window = &state.released[0];
    assert_eq!(window.len(), hcb::WINDOW_SIZE);
    let (pad, tail) = window.split_at(hcb::WINDOW_SIZE - image.len());
    assert_eq!(tail, &image[..]);
    assert!(pad.iter().all(|&b| b == 0x42));

    let boots = dev.regs().boots();
    assert_eq!(boots.len(), 1);
    assert!(boots[0].from_hcdw);
    assert_eq!(boots[0].hcb_address, SIM_DMA_BASE);
    assert_eq!(boots[0].hcb_size, 0x0020_0001);
    assert_eq!(pci.calls, vec!["unbind", "bus_master"]);
}

#[test]
fn host_boot_clears_window_registers_afterwards() {
    let mut dev = handle(SimulatedIoc::new(RegisterSet::Mpt));
    dev.host_boot(&mut RecordingPci::default(), &mut SimDma::new(), &firmware(16))
        .unwrap();

    let regs = dev.regs();
    assert_eq!(regs.read32(Register::HcbSize), 0);
    assert_eq!(regs.read32(Register::HcbAddressLow), 0);
    assert_eq!(regs.read32(Register::HcbAddressHigh), 0);
    assert_eq!(regs.diag() & diag::HOLD_IOC_RESET, 0);
}

#[test]
fn host_boot_succeeds_when_booted_firmware_stays_locked() {
    let mut dev = handle(SimulatedIoc::new(RegisterSet::Mpt).locking_after_boot());
    let mut dma = SimDma::new();

    dev.host_boot(&mut RecordingPci::default(), &mut dma, &firmware(4096))
        .unwrap();

    assert_eq!(dev.regs().boots().len(), 1);
    assert_eq!(dma.state().live, 0);
    assert!(!dev.detection().unlocked);
    assert!(dev.info().state().contains(DoorbellState::READY));
}

#[test]
fn host_boot_timeout_still_releases_window() {
    let sim = SimulatedIoc::new(RegisterSet::Mpt).with_script(DoorbellScript::Never);
    let mut dev = handle(sim);
    let mut dma = SimDma::new();

    let err = dev
        .host_boot(&mut RecordingPci::default(), &mut dma, &firmware(1024))
        .unwrap_err();
    assert!(matches!(err, LsiError::IocNotReady { .. }), "{err}");

    let state = dma.state();
    assert_eq!(state.allocations, 1);
    assert_eq!(state.live, 0, "DMA window leaked");
    assert_eq!(dev.regs().read32(Register::HcbSize), 0);
}

#[test]
fn host_boot_rejects_oversized_image_before_touching_card() {
    let mut dev = handle(SimulatedIoc::new(RegisterSet::Mpt));
    let mut pci = RecordingPci::default();
    let mut dma = SimDma::new();

    let err = dev
        .host_boot(&mut pci, &mut dma, &firmware(hcb::WINDOW_SIZE + 1))
        .unwrap_err();
    assert!(matches!(err, LsiError::FirmwareTooLarge { .. }));
    assert_eq!(dev.regs().resets(), 0);
    assert!(pci.calls.is_empty());
    assert_eq!(dma.state().allocations, 0);
}

#[test]
fn host_boot_accepts_full_window_image() {
    let mut dev = handle(SimulatedIoc::new(RegisterSet::Mpt));
    let mut dma = SimDma::new();
    let image = firmware(hcb::WINDOW_SIZE);

    dev.host_boot(&mut RecordingPci::default(), &mut dma, &image)
        .unwrap();
    assert_eq!(dma.state().released[0], image);
}

#[test]
fn host_boot_allocation_failure_leaves_window_unprogrammed() {
    let mut dev = handle(SimulatedIoc::new(RegisterSet::Mpt));
    let err = dev
        .host_boot(&mut RecordingPci::default(), &mut SimDma::failing(), &firmware(64))
        .unwrap_err();
    assert!(matches!(err, LsiError::Dma { .. }));
    assert!(dev.regs().boots().is_empty());
    assert_eq!(dev.regs().read32(Register::HcbSize), 0);
}
