//! A mock guest for driving the unpacker without a hypervisor.
//!
//! Guest memory is a map of 4 KiB frames; page tables, kernel structures
//! and user pages are all synthesized into it through the same profile
//! the engine reads them back with.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    time::Duration,
};

use hvunpack_core::{
    EventReason, EventResponse, Gfn, MemoryAccess, MemoryAccessEvent, PAGE_MASK, PAGE_SIZE, Pa,
    Pid, ProcessEvent, Registers, SinglestepEvent, Va, VcpuId, VmInfo, VmiDriver, VmiError,
    VmiEvent,
    paging::{PageTableLevel, gfn_from_pa, pa_from_gfn, resolve, va_offset},
    profile::{
        BitRange, ControlAreaOffsets, FileObjectOffsets, KernelSymbols, ProcessOffsets, Profile,
        UnicodeStringOffsets, VadFlagRanges, VadOffsets,
    },
};

/// Kernel VA of the active-process list head.
pub const PROCESS_HEAD: Va = Va(0xffff_8000_0010_0000);

/// Translation root shared by the kernel and the primary process.
pub const KERNEL_ROOT: Pa = Pa(0x1000);

pub const MM_EXECUTE_READ: u64 = 3;
pub const MM_READWRITE: u64 = 4;
pub const MM_EXECUTE_READWRITE: u64 = 6;
pub const MM_GUARD: u64 = 0x10;

pub const VAD_PRIVATE: u64 = 0;
pub const VAD_IMAGE: u64 = 2;

/// The profile every test reads guest structures through.
pub fn profile() -> Profile {
    Profile {
        kernel: KernelSymbols {
            active_process_head: PROCESS_HEAD,
        },
        process: ProcessOffsets {
            unique_process_id: 0x00,
            inherited_from_unique_process_id: 0x08,
            active_process_links: 0x10,
            directory_table_base: 0x20,
            vad_root: 0x28,
            section_base_address: 0x30,
            image_file_name: 0x38,
        },
        vad: VadOffsets {
            left_child: 0x00,
            right_child: 0x08,
            starting_vpn: 0x10,
            ending_vpn: 0x18,
            flags: 0x20,
            control_area: 0x28,
        },
        control_area: ControlAreaOffsets { file_object: 0x40 },
        file_object: FileObjectOffsets { file_name: 0x58 },
        unicode_string: UnicodeStringOffsets {
            length: 0x00,
            buffer: 0x08,
        },
        vad_flags: VadFlagRanges {
            vad_type: BitRange { start: 0, end: 2 },
            private_memory: BitRange { start: 3, end: 3 },
            protection: BitRange { start: 4, end: 8 },
        },
    }
}

/// Packs a VAD flags word the way [`profile`] unpacks it.
pub fn vad_flags(vad_type: u64, private: bool, protection: u64) -> u64 {
    vad_type | (u64::from(private) << 3) | (protection << 4)
}

pub struct MockDriver {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    pub access: RefCell<HashMap<Gfn, MemoryAccess>>,
    pub access_calls: Cell<usize>,
    cr3: Cell<u64>,
    next_gfn: Cell<u64>,
}

impl MockDriver {
    /// Present + writable, no-execute.
    pub const RW: u64 = 1 | (1 << 1) | (1 << 63);

    /// Present + writable + executable.
    pub const RWX: u64 = 1 | (1 << 1);

    const TABLE_FLAGS: u64 = 1 | (1 << 1);

    pub fn new() -> Self {
        Self {
            pages: RefCell::new(HashMap::new()),
            access: RefCell::new(HashMap::new()),
            access_calls: Cell::new(0),
            cr3: Cell::new(KERNEL_ROOT.0),
            next_gfn: Cell::new(0x1_0000),
        }
    }

    pub fn set_cr3(&self, cr3: u64) {
        self.cr3.set(cr3);
    }

    pub fn alloc_gfn(&self) -> Gfn {
        let gfn = Gfn(self.next_gfn.get());
        self.next_gfn.set(gfn.0 + 1);
        self.pages
            .borrow_mut()
            .insert(gfn, vec![0u8; PAGE_SIZE as usize]);
        gfn
    }

    pub fn insert_page(&self, gfn: Gfn) {
        self.pages
            .borrow_mut()
            .insert(gfn, vec![0u8; PAGE_SIZE as usize]);
    }

    /// Inserts a blank page only if the frame does not exist yet.
    pub fn ensure_page(&self, gfn: Gfn) {
        self.pages
            .borrow_mut()
            .entry(gfn)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize]);
    }

    pub fn write_phys(&self, pa: Pa, data: &[u8]) {
        let gfn = gfn_from_pa(pa);
        let offset = (pa.0 & (PAGE_SIZE - 1)) as usize;
        let mut pages = self.pages.borrow_mut();
        let page = pages
            .get_mut(&gfn)
            .unwrap_or_else(|| panic!("no page at {gfn}"));
        page[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read_phys_u64(&self, pa: Pa) -> u64 {
        let gfn = gfn_from_pa(pa);
        let offset = (pa.0 & (PAGE_SIZE - 1)) as usize;
        let pages = self.pages.borrow();
        let page = &pages[&gfn];
        u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap())
    }

    fn entry_pa(&self, table_gfn: Gfn, index: u64) -> Pa {
        pa_from_gfn(table_gfn) + index * 8
    }

    fn table_for(&self, root: Pa, va: Va, level: PageTableLevel) -> Gfn {
        let mut table_gfn = gfn_from_pa(root);
        if !self.pages.borrow().contains_key(&table_gfn) {
            self.insert_page(table_gfn);
        }

        for current in [
            PageTableLevel::Pml4,
            PageTableLevel::Pdpt,
            PageTableLevel::Pd,
        ] {
            if current == level {
                break;
            }

            let entry_pa = self.entry_pa(table_gfn, current.va_index(va));
            let entry = self.read_phys_u64(entry_pa);
            if entry & 1 != 0 {
                table_gfn = Gfn((entry >> 12) & ((1 << 40) - 1));
            }
            else {
                let next = self.alloc_gfn();
                self.write_phys(
                    entry_pa,
                    &((next.0 << 12) | Self::TABLE_FLAGS).to_le_bytes(),
                );
                table_gfn = next;
            }
        }

        table_gfn
    }

    /// Maps a 4 KiB page at `va`, allocating the backing frame.
    pub fn map_page(&self, root: Pa, va: Va, flags: u64) -> Gfn {
        let pt_gfn = self.table_for(root, va, PageTableLevel::Pt);
        let data_gfn = self.alloc_gfn();
        self.write_phys(
            self.entry_pa(pt_gfn, PageTableLevel::Pt.va_index(va)),
            &((data_gfn.0 << 12) | flags).to_le_bytes(),
        );
        data_gfn
    }

    /// Writes bytes through the guest page tables at `va`.
    pub fn write_virt(&self, root: Pa, va: Va, data: &[u8]) {
        let mut written = 0usize;
        while written < data.len() {
            let va = va + written as u64;
            let mapping = resolve(self, root, va).expect("write_virt target not mapped");
            let chunk = std::cmp::min(data.len() - written, (PAGE_SIZE - va_offset(va)) as usize);
            self.write_phys(mapping.pa, &data[written..written + chunk]);
            written += chunk;
        }
    }

    /// Returns the SLAT access of a frame, RWX if never set.
    pub fn slat_access(&self, gfn: Gfn) -> MemoryAccess {
        *self.access.borrow().get(&gfn).unwrap_or(&MemoryAccess::RWX)
    }
}

impl VmiDriver for MockDriver {
    fn info(&self) -> Result<VmInfo, VmiError> {
        Ok(VmInfo {
            page_size: PAGE_SIZE,
            max_gfn: Gfn(0xF_FFFF),
            vcpus: 1,
        })
    }

    fn pause(&self) -> Result<(), VmiError> {
        Ok(())
    }

    fn resume(&self) -> Result<(), VmiError> {
        Ok(())
    }

    fn registers(&self, _vcpu: VcpuId) -> Result<Registers, VmiError> {
        Ok(Registers {
            rip: 0,
            rsp: 0,
            cr3: self.cr3.get(),
        })
    }

    fn read_page(&self, gfn: Gfn) -> Result<Vec<u8>, VmiError> {
        let pages = self.pages.borrow();
        let page = pages.get(&gfn).ok_or(VmiError::Other("page not found"))?;
        Ok(page.clone())
    }

    fn memory_access(&self, gfn: Gfn) -> Result<MemoryAccess, VmiError> {
        Ok(self.slat_access(gfn))
    }

    fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError> {
        self.access_calls.set(self.access_calls.get() + 1);
        self.access.borrow_mut().insert(gfn, access);
        Ok(())
    }

    fn monitor_process_events(&self, _enable: bool) -> Result<(), VmiError> {
        Ok(())
    }

    fn wait_for_event(
        &self,
        _timeout: Duration,
        _handler: &mut dyn FnMut(&VmiEvent) -> EventResponse,
    ) -> Result<(), VmiError> {
        Err(VmiError::Timeout)
    }
}

/// Synthesizes kernel structures into a mock guest.
pub struct Guest {
    pub driver: MockDriver,

    /// Bump allocator for kernel structure storage.
    next_kva: u64,

    /// Last process linked into the active list.
    list_tail: Va,
}

impl Guest {
    pub fn new() -> Self {
        let driver = MockDriver::new();

        // The list head page; head starts self-referential.
        driver.map_page(KERNEL_ROOT, PROCESS_HEAD, MockDriver::RW);

        let guest = Self {
            driver,
            next_kva: 0xffff_8000_0020_0000,
            list_tail: PROCESS_HEAD,
        };
        guest.write_kernel_u64(PROCESS_HEAD, PROCESS_HEAD.0);
        guest
    }

    fn write_kernel_u64(&self, va: Va, value: u64) {
        self.driver
            .write_virt(KERNEL_ROOT, va, &value.to_le_bytes());
    }

    /// Allocates zeroed kernel storage, page-mapped on demand.
    pub fn alloc_struct(&mut self, size: u64) -> Va {
        let va = Va(self.next_kva);
        self.next_kva += size.next_multiple_of(0x100);

        let mut page = va & PAGE_MASK;
        let end = Va(self.next_kva);
        while page < end {
            let mapped = matches!(
                resolve(&self.driver, KERNEL_ROOT, page),
                Ok(mapping) if mapping.present
            );
            if !mapped {
                self.driver.map_page(KERNEL_ROOT, page, MockDriver::RW);
            }
            page = page + PAGE_SIZE;
        }

        va
    }

    /// Creates a process descriptor and links it into the active list.
    pub fn add_process(&mut self, pid: Pid, name: &str, image_base: Va, root: Pa) -> Va {
        self.driver.ensure_page(gfn_from_pa(root));

        let object = self.alloc_struct(0x100);
        let profile = profile();

        self.write_kernel_u64(object + profile.process.unique_process_id, pid.0 as u64);
        self.write_kernel_u64(object + profile.process.directory_table_base, root.0);
        self.write_kernel_u64(object + profile.process.section_base_address, image_base.0);

        let mut name_bytes = [0u8; 15];
        name_bytes[..name.len().min(15)].copy_from_slice(&name.as_bytes()[..name.len().min(15)]);
        self.driver.write_virt(
            KERNEL_ROOT,
            object + profile.process.image_file_name,
            &name_bytes,
        );

        // Append to the circular active-process list.
        let links = object + profile.process.active_process_links;
        self.write_kernel_u64(self.list_tail, links.0);
        self.write_kernel_u64(links, PROCESS_HEAD.0);
        self.list_tail = links;

        object
    }

    /// Sets the VAD root of a process descriptor.
    pub fn set_vad_root(&self, object: Va, vad_root: Va) {
        self.write_kernel_u64(object + profile().process.vad_root, vad_root.0);
    }

    /// Creates a file object whose name is `name`.
    pub fn file_object(&mut self, name: &str) -> Va {
        let profile = profile();

        let utf16: Vec<u8> = name.encode_utf16().flat_map(u16::to_le_bytes).collect();
        let buffer = self.alloc_struct(utf16.len() as u64);
        self.driver.write_virt(KERNEL_ROOT, buffer, &utf16);

        let object = self.alloc_struct(0x100);
        let string = object + profile.file_object.file_name;
        self.driver.write_virt(
            KERNEL_ROOT,
            string + profile.unicode_string.length,
            &(utf16.len() as u16).to_le_bytes(),
        );
        self.write_kernel_u64(string + profile.unicode_string.buffer, buffer.0);

        object
    }

    /// Creates a VAD node. Children start NULL; wire them with
    /// [`Guest::set_children`].
    pub fn vad_node(
        &mut self,
        starting_vpn: u64,
        ending_vpn: u64,
        flags: u64,
        file_object: Option<Va>,
    ) -> Va {
        let profile = profile();
        let node = self.alloc_struct(0x60);

        self.write_kernel_u64(node + profile.vad.starting_vpn, starting_vpn);
        self.write_kernel_u64(node + profile.vad.ending_vpn, ending_vpn);
        self.write_kernel_u64(node + profile.vad.flags, flags);

        if let Some(file_object) = file_object {
            let control_area = self.alloc_struct(0x80);
            // Tag the pointer with a fast-reference count; readers must
            // mask it.
            self.write_kernel_u64(
                control_area + profile.control_area.file_object,
                file_object.0 | 0x5,
            );
            self.write_kernel_u64(node + profile.vad.control_area, control_area.0);
        }

        node
    }

    /// Wires the children of a VAD node.
    pub fn set_children(&self, node: Va, left: Option<Va>, right: Option<Va>) {
        let profile = profile();
        self.write_kernel_u64(
            node + profile.vad.left_child,
            left.map_or(0, |va| va.0),
        );
        self.write_kernel_u64(
            node + profile.vad.right_child,
            right.map_or(0, |va| va.0),
        );
    }
}

/// Builds a memory-access event.
pub fn memory_event(cr3: Pa, rip: u64, va: Va, pa: Pa, access: MemoryAccess) -> VmiEvent {
    VmiEvent::new(
        VcpuId(0),
        Registers {
            rip,
            rsp: 0x7f00_0000_0000,
            cr3: cr3.0,
        },
        EventReason::MemoryAccess(MemoryAccessEvent { pa, va, access }),
    )
}

/// Builds a singlestep event.
pub fn singlestep_event(cr3: Pa, rip: u64, gfn: Gfn) -> VmiEvent {
    VmiEvent::new(
        VcpuId(0),
        Registers {
            rip,
            rsp: 0x7f00_0000_0000,
            cr3: cr3.0,
        },
        EventReason::Singlestep(SinglestepEvent { gfn }),
    )
}

/// Builds a process-created event.
pub fn process_created(object: Va, pid: Pid, parent: Pid) -> VmiEvent {
    VmiEvent::new(
        VcpuId(0),
        Registers::default(),
        EventReason::ProcessCreated(ProcessEvent {
            object,
            pid,
            parent,
        }),
    )
}

/// Builds a process-exited event.
pub fn process_exited(pid: Pid) -> VmiEvent {
    VmiEvent::new(
        VcpuId(0),
        Registers::default(),
        EventReason::ProcessExited(ProcessEvent {
            object: Va(0),
            pid,
            parent: Pid(0),
        }),
    )
}
