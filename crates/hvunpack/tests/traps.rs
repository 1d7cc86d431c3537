//! Trap controller bookkeeping against the mock driver.

mod common;

use hvunpack::traps::TrapController;
use hvunpack_core::{Gfn, MemoryAccess, VcpuId, Vmi};

use crate::common::MockDriver;

const GFN: Gfn = Gfn(0x1234);
const VCPU: VcpuId = VcpuId(0);

#[test]
fn arming_is_idempotent_per_right() {
    let driver = MockDriver::new();
    let vmi = Vmi::new(&driver);
    let mut traps = TrapController::new();

    traps.arm(&vmi, GFN, MemoryAccess::W);
    assert_eq!(driver.slat_access(GFN), MemoryAccess::RX);
    assert_eq!(driver.access_calls.get(), 1);

    // Re-arming the same right is a no-op.
    traps.arm(&vmi, GFN, MemoryAccess::W);
    assert_eq!(driver.access_calls.get(), 1);

    // A new right updates the SLAT once.
    traps.arm(&vmi, GFN, MemoryAccess::X);
    assert_eq!(driver.slat_access(GFN), MemoryAccess::R);
    assert_eq!(driver.access_calls.get(), 2);
}

#[test]
fn disarm_restores_rights_incrementally() {
    let driver = MockDriver::new();
    let vmi = Vmi::new(&driver);
    let mut traps = TrapController::new();

    traps.arm(&vmi, GFN, MemoryAccess::W | MemoryAccess::X);
    assert_eq!(driver.slat_access(GFN), MemoryAccess::R);

    traps.disarm(&vmi, GFN, MemoryAccess::X);
    assert_eq!(driver.slat_access(GFN), MemoryAccess::RX);
    assert!(traps.is_armed(GFN));

    traps.disarm(&vmi, GFN, MemoryAccess::W);
    assert_eq!(driver.slat_access(GFN), MemoryAccess::RWX);
    assert!(!traps.is_armed(GFN));
}

#[test]
fn singlestep_grants_then_reapplies() {
    let driver = MockDriver::new();
    let vmi = Vmi::new(&driver);
    let mut traps = TrapController::new();

    traps.arm(&vmi, GFN, MemoryAccess::W);
    assert_eq!(driver.slat_access(GFN), MemoryAccess::RX);

    traps.begin_singlestep(&vmi, VCPU, GFN);
    assert!(traps.stepping(VCPU));
    assert_eq!(driver.slat_access(GFN), MemoryAccess::RWX);

    traps.complete_singlestep(&vmi, VCPU);
    assert!(!traps.stepping(VCPU));
    assert_eq!(driver.slat_access(GFN), MemoryAccess::RX);
}

#[test]
fn singlestep_respects_rights_changed_mid_step() {
    let driver = MockDriver::new();
    let vmi = Vmi::new(&driver);
    let mut traps = TrapController::new();

    traps.arm(&vmi, GFN, MemoryAccess::W | MemoryAccess::X);
    traps.begin_singlestep(&vmi, VCPU, GFN);

    // The execute trap is dropped while the step is outstanding.
    traps.disarm(&vmi, GFN, MemoryAccess::X);

    traps.complete_singlestep(&vmi, VCPU);
    assert_eq!(driver.slat_access(GFN), MemoryAccess::RX);
}

#[test]
fn singlestep_on_unarmed_frame_is_a_noop() {
    let driver = MockDriver::new();
    let vmi = Vmi::new(&driver);
    let mut traps = TrapController::new();

    traps.begin_singlestep(&vmi, VCPU, GFN);
    assert!(!traps.stepping(VCPU));
    assert_eq!(driver.access_calls.get(), 0);

    traps.complete_singlestep(&vmi, VCPU);
    assert_eq!(driver.access_calls.get(), 0);
}

#[test]
fn disarm_all_lifts_every_trap() {
    let driver = MockDriver::new();
    let vmi = Vmi::new(&driver);
    let mut traps = TrapController::new();

    for gfn in [Gfn(1), Gfn(2), Gfn(3)] {
        traps.arm(&vmi, gfn, MemoryAccess::W);
    }

    traps.disarm_all(&vmi);
    for gfn in [Gfn(1), Gfn(2), Gfn(3)] {
        assert_eq!(driver.slat_access(gfn), MemoryAccess::RWX);
        assert!(!traps.is_armed(gfn));
    }
}
