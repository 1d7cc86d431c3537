//! A mock VMI driver backed by an in-memory guest.

use std::{cell::RefCell, collections::HashMap, time::Duration};

use crate::{
    EventResponse, Gfn, MemoryAccess, PAGE_SIZE, Pa, Registers, Va, VcpuId, VmInfo, VmiDriver,
    VmiError, VmiEvent,
    paging::{PageTableLevel, gfn_from_pa, pa_from_gfn, va_offset},
};

pub struct MockDriver {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    access: RefCell<HashMap<Gfn, MemoryAccess>>,
    next_gfn: RefCell<u64>,
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
            next_gfn: RefCell::new(0x1000),
        }
    }

    pub fn alloc_gfn(&self) -> Gfn {
        let mut next = self.next_gfn.borrow_mut();
        let gfn = Gfn(*next);
        *next += 1;
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

    /// Walks down to the table at `level`, allocating intermediate tables
    /// as needed, and returns its GFN.
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

    /// Maps a 2 MiB page at `va` onto `target`.
    pub fn map_large_page(&self, root: Pa, va: Va, target: Gfn) -> Gfn {
        let pd_gfn = self.table_for(root, va, PageTableLevel::Pd);
        self.insert_page(target);
        self.write_phys(
            self.entry_pa(pd_gfn, PageTableLevel::Pd.va_index(va)),
            &((target.0 << 12) | Self::TABLE_FLAGS | (1 << 7)).to_le_bytes(),
        );
        pd_gfn
    }

    /// Clears the present bit of the leaf entry mapping `va`.
    pub fn unmap_leaf(&self, root: Pa, va: Va) {
        let pt_gfn = self.table_for(root, va, PageTableLevel::Pt);
        let entry_pa = self.entry_pa(pt_gfn, PageTableLevel::Pt.va_index(va));
        let entry = self.read_phys_u64(entry_pa);
        self.write_phys(entry_pa, &(entry & !1).to_le_bytes());
    }

    /// Writes bytes through the guest page tables at `va`.
    pub fn write_virt(&self, root: Pa, va: Va, data: &[u8]) {
        let mut written = 0usize;
        while written < data.len() {
            let va = va + written as u64;
            let mapping =
                crate::paging::resolve(self, root, va).expect("write_virt target not mapped");
            let chunk = std::cmp::min(
                data.len() - written,
                (PAGE_SIZE - va_offset(va)) as usize,
            );
            self.write_phys(mapping.pa, &data[written..written + chunk]);
            written += chunk;
        }
    }
}

impl VmiDriver for MockDriver {
    fn info(&self) -> Result<VmInfo, VmiError> {
        Ok(VmInfo {
            page_size: PAGE_SIZE,
            max_gfn: Gfn(0xFFFF),
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
        Ok(Registers::default())
    }

    fn read_page(&self, gfn: Gfn) -> Result<Vec<u8>, VmiError> {
        let pages = self.pages.borrow();
        let page = pages.get(&gfn).ok_or(VmiError::Other("page not found"))?;
        Ok(page.clone())
    }

    fn memory_access(&self, gfn: Gfn) -> Result<MemoryAccess, VmiError> {
        Ok(*self
            .access
            .borrow()
            .get(&gfn)
            .unwrap_or(&MemoryAccess::RWX))
    }

    fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError> {
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
