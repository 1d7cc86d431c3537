use crate::{Gfn, MemoryAccess, PAGE_MASK, Pa, Pid, Va, VcpuId};

/// The CPU register state captured with an event.
///
/// Only the registers the unpacker consumes are carried: the instruction
/// pointer, the stack pointer, and the translation root.
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    /// Instruction pointer at the time of the event.
    pub rip: u64,

    /// Stack pointer at the time of the event.
    pub rsp: u64,

    /// Control register 3 (page-table root plus PCID bits).
    pub cr3: u64,
}

impl Registers {
    /// Returns the page-table root, with the PCID/flag bits masked off.
    pub fn translation_root(&self) -> Pa {
        Pa(self.cr3 & PAGE_MASK)
    }

    /// Returns the instruction pointer as a virtual address.
    pub fn instruction_pointer(&self) -> Va {
        Va(self.rip)
    }
}

/// Event generated when monitored memory is accessed.
#[derive(Debug, Clone, Copy)]
pub struct MemoryAccessEvent {
    /// Physical address that was accessed.
    pub pa: Pa,

    /// Virtual address that was accessed.
    pub va: Va,

    /// Type of access that occurred (read/write/execute).
    pub access: MemoryAccess,
}

/// Event generated when a single-stepped instruction retires.
#[derive(Debug, Clone, Copy)]
pub struct SinglestepEvent {
    /// GFN of the instruction that was stepped over.
    pub gfn: Gfn,
}

/// Event generated when a process is created or exits.
#[derive(Debug, Clone, Copy)]
pub struct ProcessEvent {
    /// Kernel address of the process descriptor.
    pub object: Va,

    /// Identifier of the process.
    pub pid: Pid,

    /// Identifier of the parent process.
    pub parent: Pid,
}

/// Reason for an event.
#[derive(Debug, Clone, Copy)]
pub enum EventReason {
    /// Memory access event (read/write/execute).
    MemoryAccess(MemoryAccessEvent),

    /// Singlestep event.
    Singlestep(SinglestepEvent),

    /// A process was created in the guest.
    ProcessCreated(ProcessEvent),

    /// A process exited in the guest.
    ProcessExited(ProcessEvent),
}

/// An event delivered by the VMI driver.
///
/// The virtual CPU that generated the event is paused until the handler
/// returns its [`EventResponse`].
#[derive(Debug, Clone, Copy)]
pub struct VmiEvent {
    vcpu_id: VcpuId,
    registers: Registers,
    reason: EventReason,
}

impl VmiEvent {
    /// Creates a new VMI event.
    pub fn new(vcpu_id: VcpuId, registers: Registers, reason: EventReason) -> Self {
        Self {
            vcpu_id,
            registers,
            reason,
        }
    }

    /// Returns the ID of the virtual CPU where the event occurred.
    pub fn vcpu_id(&self) -> VcpuId {
        self.vcpu_id
    }

    /// Returns a reference to the CPU registers at the time of the event.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Returns a reference to the reason for the event.
    pub fn reason(&self) -> &EventReason {
        &self.reason
    }
}

bitflags::bitflags! {
    /// Flags that can be set in an event response.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EventResponseFlags: u8 {
        /// Toggle single-step mode for the faulting vCPU.
        const TOGGLE_SINGLESTEP = 1 << 0;
    }
}

/// A response to a VMI event.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventResponse {
    /// Flags associated with the response.
    pub flags: EventResponseFlags,
}

impl EventResponse {
    /// Creates a response that toggles single-step mode.
    pub fn toggle_singlestep() -> Self {
        Self {
            flags: EventResponseFlags::TOGGLE_SINGLESTEP,
        }
    }
}
