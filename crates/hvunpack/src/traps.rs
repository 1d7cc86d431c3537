//! SLAT trap management.
//!
//! The controller tracks which access rights fault on which guest frames
//! and keeps the hypervisor's second-level permissions in sync. Arming is
//! idempotent per `(frame, right)`.
//!
//! When a trapped instruction must make forward progress, the controller
//! temporarily grants the offending rights, the vCPU single-steps exactly
//! one instruction, and the trap is re-applied before the guest resumes.
//! While a step is outstanding for a vCPU, no other event of that vCPU is
//! dispatched, so the bookkeeping is a plain per-vCPU slot.

use std::collections::HashMap;

use hvunpack_core::{Gfn, MemoryAccess, VcpuId, Vmi, VmiDriver};

/// Arms, disarms and single-steps SLAT traps on guest frames.
#[derive(Debug, Default)]
pub struct TrapController {
    /// Faulting rights per armed frame.
    armed: HashMap<Gfn, MemoryAccess>,

    /// Frame whose trap is lifted while the vCPU steps over it.
    stepping: HashMap<VcpuId, Gfn>,
}

impl TrapController {
    /// Creates a controller with no armed frames.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rights currently faulting on a frame.
    pub fn faulting_rights(&self, gfn: Gfn) -> MemoryAccess {
        self.armed.get(&gfn).copied().unwrap_or_default()
    }

    /// Checks whether any right is armed on a frame.
    pub fn is_armed(&self, gfn: Gfn) -> bool {
        self.armed.contains_key(&gfn)
    }

    fn apply<Driver>(vmi: &Vmi<Driver>, gfn: Gfn, faulting: MemoryAccess) -> bool
    where
        Driver: VmiDriver,
    {
        let allowed = MemoryAccess::RWX - faulting;
        match vmi.set_memory_access(gfn, allowed) {
            Ok(()) => true,
            Err(err) => {
                // The frame may not be present in the SLAT right now; it
                // will be re-armed the next time it is observed.
                tracing::warn!(%gfn, %allowed, ?err, "failed to update SLAT access");
                false
            }
        }
    }

    /// Makes the given rights fault on a frame.
    ///
    /// Already-armed rights are left untouched; a failure is logged and
    /// the frame forgotten so a later observation retries.
    pub fn arm<Driver>(&mut self, vmi: &Vmi<Driver>, gfn: Gfn, rights: MemoryAccess)
    where
        Driver: VmiDriver,
    {
        let current = self.faulting_rights(gfn);
        let wanted = current | rights;
        if wanted == current {
            return;
        }

        if Self::apply(vmi, gfn, wanted) {
            self.armed.insert(gfn, wanted);
        }
        else {
            self.armed.remove(&gfn);
        }
    }

    /// Stops the given rights from faulting on a frame.
    pub fn disarm<Driver>(&mut self, vmi: &Vmi<Driver>, gfn: Gfn, rights: MemoryAccess)
    where
        Driver: VmiDriver,
    {
        let current = self.faulting_rights(gfn);
        let wanted = current - rights;
        if wanted == current {
            return;
        }

        Self::apply(vmi, gfn, wanted);
        if wanted.is_empty() {
            self.armed.remove(&gfn);
        }
        else {
            self.armed.insert(gfn, wanted);
        }
    }

    /// Removes every trap, best effort.
    pub fn disarm_all<Driver>(&mut self, vmi: &Vmi<Driver>)
    where
        Driver: VmiDriver,
    {
        for &gfn in self.armed.keys() {
            let _ = vmi.set_memory_access(gfn, MemoryAccess::RWX);
        }

        self.armed.clear();
        self.stepping.clear();
    }

    /// Removes the traps of a set of frames, best effort.
    pub fn disarm_frames<Driver>(&mut self, vmi: &Vmi<Driver>, frames: &[Gfn])
    where
        Driver: VmiDriver,
    {
        for &gfn in frames {
            if self.armed.remove(&gfn).is_some() {
                let _ = vmi.set_memory_access(gfn, MemoryAccess::RWX);
            }
        }
    }

    /// Grants full access to a frame so the faulting instruction can
    /// complete, and records the pending re-arm for the vCPU.
    pub fn begin_singlestep<Driver>(&mut self, vmi: &Vmi<Driver>, vcpu: VcpuId, gfn: Gfn)
    where
        Driver: VmiDriver,
    {
        if self.is_armed(gfn) {
            Self::apply(vmi, gfn, MemoryAccess::default());
            if let Some(previous) = self.stepping.insert(vcpu, gfn) {
                tracing::error!(%vcpu, %previous, "overlapping single-step");
            }
        }
    }

    /// Re-applies the trap lifted by [`begin_singlestep`] once the stepped
    /// instruction retired.
    ///
    /// [`begin_singlestep`]: Self::begin_singlestep
    pub fn complete_singlestep<Driver>(&mut self, vmi: &Vmi<Driver>, vcpu: VcpuId)
    where
        Driver: VmiDriver,
    {
        let gfn = match self.stepping.remove(&vcpu) {
            Some(gfn) => gfn,
            None => return,
        };

        // The machine may have disarmed the frame while the step was
        // outstanding (e.g. the execute trap after a dump).
        if let Some(&faulting) = self.armed.get(&gfn) {
            if Self::apply(vmi, gfn, faulting) {
                return;
            }
            self.armed.remove(&gfn);
        }
        else {
            let _ = vmi.set_memory_access(gfn, MemoryAccess::RWX);
        }
    }

    /// Checks whether a single-step is outstanding for a vCPU.
    pub fn stepping(&self, vcpu: VcpuId) -> bool {
        self.stepping.contains_key(&vcpu)
    }
}
