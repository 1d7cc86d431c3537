use std::time::Duration;

use crate::{EventResponse, Gfn, MemoryAccess, Registers, VcpuId, VmiError, VmiEvent};

/// Information about the introspected virtual machine.
#[derive(Debug, Clone, Copy)]
pub struct VmInfo {
    /// Page size in bytes.
    pub page_size: u64,

    /// Highest guest frame number.
    pub max_gfn: Gfn,

    /// Number of virtual CPUs.
    pub vcpus: u16,
}

/// A trait for implementing a VMI driver.
///
/// The driver owns every hypervisor-specific concern: pausing and resuming
/// the domain, reading guest-physical memory, installing second-level
/// (SLAT) access traps per frame and per right, single-stepping, and
/// delivering events.
///
/// The trait is dyn-compatible so that a binary can select a backend at
/// runtime behind `Box<dyn VmiDriver>`.
pub trait VmiDriver {
    /// Retrieves information about the virtual machine.
    fn info(&self) -> Result<VmInfo, VmiError>;

    /// Pauses the virtual machine.
    fn pause(&self) -> Result<(), VmiError>;

    /// Resumes the virtual machine.
    fn resume(&self) -> Result<(), VmiError>;

    /// Retrieves the registers of a specific virtual CPU.
    fn registers(&self, vcpu: VcpuId) -> Result<Registers, VmiError>;

    /// Reads a page of guest-physical memory.
    fn read_page(&self, gfn: Gfn) -> Result<Vec<u8>, VmiError>;

    /// Retrieves the SLAT access permissions for a specific GFN.
    fn memory_access(&self, gfn: Gfn) -> Result<MemoryAccess, VmiError>;

    /// Sets the SLAT access permissions for a specific GFN.
    ///
    /// Access types missing from `access` fault into the event handler.
    fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError>;

    /// Enables or disables delivery of process creation and exit events.
    fn monitor_process_events(&self, enable: bool) -> Result<(), VmiError>;

    /// Waits for an event to occur and processes it with the provided
    /// handler.
    ///
    /// Blocks until an event occurs or the timeout is reached; a timeout
    /// returns [`VmiError::Timeout`]. The faulting vCPU stays paused for
    /// the duration of the handler call.
    fn wait_for_event(
        &self,
        timeout: Duration,
        handler: &mut dyn FnMut(&VmiEvent) -> EventResponse,
    ) -> Result<(), VmiError>;
}

impl<T> VmiDriver for &T
where
    T: VmiDriver + ?Sized,
{
    fn info(&self) -> Result<VmInfo, VmiError> {
        (**self).info()
    }

    fn pause(&self) -> Result<(), VmiError> {
        (**self).pause()
    }

    fn resume(&self) -> Result<(), VmiError> {
        (**self).resume()
    }

    fn registers(&self, vcpu: VcpuId) -> Result<Registers, VmiError> {
        (**self).registers(vcpu)
    }

    fn read_page(&self, gfn: Gfn) -> Result<Vec<u8>, VmiError> {
        (**self).read_page(gfn)
    }

    fn memory_access(&self, gfn: Gfn) -> Result<MemoryAccess, VmiError> {
        (**self).memory_access(gfn)
    }

    fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError> {
        (**self).set_memory_access(gfn, access)
    }

    fn monitor_process_events(&self, enable: bool) -> Result<(), VmiError> {
        (**self).monitor_process_events(enable)
    }

    fn wait_for_event(
        &self,
        timeout: Duration,
        handler: &mut dyn FnMut(&VmiEvent) -> EventResponse,
    ) -> Result<(), VmiError> {
        (**self).wait_for_event(timeout, handler)
    }
}

impl<T> VmiDriver for Box<T>
where
    T: VmiDriver + ?Sized,
{
    fn info(&self) -> Result<VmInfo, VmiError> {
        (**self).info()
    }

    fn pause(&self) -> Result<(), VmiError> {
        (**self).pause()
    }

    fn resume(&self) -> Result<(), VmiError> {
        (**self).resume()
    }

    fn registers(&self, vcpu: VcpuId) -> Result<Registers, VmiError> {
        (**self).registers(vcpu)
    }

    fn read_page(&self, gfn: Gfn) -> Result<Vec<u8>, VmiError> {
        (**self).read_page(gfn)
    }

    fn memory_access(&self, gfn: Gfn) -> Result<MemoryAccess, VmiError> {
        (**self).memory_access(gfn)
    }

    fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError> {
        (**self).set_memory_access(gfn, access)
    }

    fn monitor_process_events(&self, enable: bool) -> Result<(), VmiError> {
        (**self).monitor_process_events(enable)
    }

    fn wait_for_event(
        &self,
        timeout: Duration,
        handler: &mut dyn FnMut(&VmiEvent) -> EventResponse,
    ) -> Result<(), VmiError> {
        (**self).wait_for_event(timeout, handler)
    }
}
