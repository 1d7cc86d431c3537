use std::time::Duration;

use crate::{
    EventResponse, Gfn, MemoryAccess, PAGE_SIZE, Pa, Registers, Va, VcpuId, VmInfo, VmiDriver,
    VmiError, VmiEvent,
    paging::{self, PageMapping, pa_offset},
    profile::UnicodeStringOffsets,
};

/// Typed access to an introspected virtual machine.
///
/// Wraps a [`VmiDriver`] with guest-virtual read helpers. Translations are
/// never cached: every read walks the guest page tables through the driver.
pub struct Vmi<Driver>
where
    Driver: VmiDriver,
{
    driver: Driver,
}

impl<Driver> Vmi<Driver>
where
    Driver: VmiDriver,
{
    /// Creates a new `Vmi` instance with the given driver.
    pub fn new(driver: Driver) -> Self {
        Self { driver }
    }

    /// Returns the underlying driver.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Retrieves information about the virtual machine.
    pub fn info(&self) -> Result<VmInfo, VmiError> {
        self.driver.info()
    }

    /// Pauses the virtual machine.
    pub fn pause(&self) -> Result<(), VmiError> {
        self.driver.pause()
    }

    /// Resumes the virtual machine.
    pub fn resume(&self) -> Result<(), VmiError> {
        self.driver.resume()
    }

    /// Pauses the virtual machine and returns a guard that will resume it
    /// when dropped.
    pub fn pause_guard(&self) -> Result<PauseGuard<'_, Driver>, VmiError> {
        PauseGuard::new(&self.driver)
    }

    /// Retrieves the register state of a virtual CPU.
    pub fn registers(&self, vcpu: VcpuId) -> Result<Registers, VmiError> {
        self.driver.registers(vcpu)
    }

    /// Retrieves the SLAT access permissions for a frame.
    pub fn memory_access(&self, gfn: Gfn) -> Result<MemoryAccess, VmiError> {
        self.driver.memory_access(gfn)
    }

    /// Sets the SLAT access permissions for a frame.
    pub fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError> {
        self.driver.set_memory_access(gfn, access)
    }

    /// Enables or disables process lifecycle events.
    pub fn monitor_process_events(&self, enable: bool) -> Result<(), VmiError> {
        self.driver.monitor_process_events(enable)
    }

    /// Waits for an event and processes it with the provided handler.
    pub fn wait_for_event(
        &self,
        timeout: Duration,
        mut handler: impl FnMut(&VmiEvent) -> EventResponse,
    ) -> Result<(), VmiError> {
        self.driver.wait_for_event(timeout, &mut handler)
    }

    /// Walks the guest page tables rooted at `root` and returns the leaf
    /// mapping of `va`.
    pub fn resolve(&self, root: Pa, va: Va) -> Result<PageMapping, VmiError> {
        paging::resolve(&self.driver, root, va)
    }

    /// Reads guest-virtual memory, failing on the first unmapped page.
    pub fn read(&self, root: Pa, va: Va, buffer: &mut [u8]) -> Result<(), VmiError> {
        let mut position = 0usize;

        while position < buffer.len() {
            let va = va + position as u64;
            let mapping = self.resolve(root, va)?;
            if !mapping.present {
                return Err(VmiError::page_fault((va, root)));
            }

            let offset = pa_offset(mapping.pa) as usize;
            let page = self.driver.read_page(mapping.gfn())?;

            let size = std::cmp::min(buffer.len() - position, PAGE_SIZE as usize - offset);
            buffer[position..position + size].copy_from_slice(&page[offset..offset + size]);

            position += size;
        }

        Ok(())
    }

    /// Reads guest-virtual memory up to the first unmapped page.
    ///
    /// Returns the number of bytes read. Paged-out memory truncates the
    /// read; driver failures propagate.
    pub fn read_partial(&self, root: Pa, va: Va, buffer: &mut [u8]) -> Result<usize, VmiError> {
        let mut position = 0usize;

        while position < buffer.len() {
            let va = va + position as u64;
            let mapping = match self.resolve(root, va) {
                Ok(mapping) if mapping.present => mapping,
                Ok(_) => break,
                Err(VmiError::NotMapped(_)) => break,
                Err(err) => return Err(err),
            };

            let offset = pa_offset(mapping.pa) as usize;
            let page = self.driver.read_page(mapping.gfn())?;

            let size = std::cmp::min(buffer.len() - position, PAGE_SIZE as usize - offset);
            buffer[position..position + size].copy_from_slice(&page[offset..offset + size]);

            position += size;
        }

        Ok(position)
    }

    /// Reads a 16-bit unsigned integer from the virtual machine.
    pub fn read_u16(&self, root: Pa, va: Va) -> Result<u16, VmiError> {
        let mut buffer = [0u8; 2];
        self.read(root, va, &mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    /// Reads a 32-bit unsigned integer from the virtual machine.
    pub fn read_u32(&self, root: Pa, va: Va) -> Result<u32, VmiError> {
        let mut buffer = [0u8; 4];
        self.read(root, va, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a 64-bit unsigned integer from the virtual machine.
    pub fn read_u64(&self, root: Pa, va: Va) -> Result<u64, VmiError> {
        let mut buffer = [0u8; 8];
        self.read(root, va, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads a 64-bit virtual address from the virtual machine.
    pub fn read_va(&self, root: Pa, va: Va) -> Result<Va, VmiError> {
        Ok(Va(self.read_u64(root, va)?))
    }

    /// Reads a fixed number of bytes from the virtual machine.
    pub fn read_vec(&self, root: Pa, va: Va, len: usize) -> Result<Vec<u8>, VmiError> {
        let mut buffer = vec![0u8; len];
        self.read(root, va, &mut buffer)?;
        Ok(buffer)
    }

    /// Reads a kernel Unicode string.
    ///
    /// Returns `None` when the string is empty or its buffer pointer is
    /// NULL. The string is decoded from UTF-16 lossily.
    pub fn read_unicode_string(
        &self,
        offsets: &UnicodeStringOffsets,
        root: Pa,
        va: Va,
    ) -> Result<Option<String>, VmiError> {
        // The `Length` field counts bytes, not characters.
        let length = self.read_u16(root, va + offsets.length)? as usize;
        if length == 0 {
            return Ok(None);
        }

        let buffer_va = self.read_va(root, va + offsets.buffer)?;
        if buffer_va.is_null() {
            return Ok(None);
        }

        let bytes = self.read_vec(root, buffer_va, length & !1)?;
        let utf16 = bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .collect::<Vec<_>>();

        Ok(Some(String::from_utf16_lossy(&utf16)))
    }
}

/// A guard that pauses the virtual machine on creation and resumes it on
/// drop.
pub struct PauseGuard<'a, Driver>
where
    Driver: VmiDriver,
{
    driver: &'a Driver,
}

impl<'a, Driver> PauseGuard<'a, Driver>
where
    Driver: VmiDriver,
{
    /// Creates a new pause guard.
    pub fn new(driver: &'a Driver) -> Result<Self, VmiError> {
        driver.pause()?;
        Ok(Self { driver })
    }
}

impl<Driver> Drop for PauseGuard<'_, Driver>
where
    Driver: VmiDriver,
{
    fn drop(&mut self) {
        if let Err(err) = self.driver.resume() {
            tracing::error!(?err, "Failed to resume the virtual machine");
        }
    }
}
