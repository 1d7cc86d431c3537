//! 4-level guest page-table walking.
//!
//! The unpacker only supports 64-bit 4-level paging. Every walk reads the
//! page-table pages through the driver, never through a cache: packers
//! remap pages aggressively and a stale translation would attribute a
//! write-then-execute transition to the wrong frame.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Gfn, Pa, Va, VmiDriver, VmiError};

/// Page size in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// Page shift in bits.
pub const PAGE_SHIFT: u64 = 12;

/// Mask selecting the page-aligned part of an address.
pub const PAGE_MASK: u64 = 0xFFFF_FFFF_FFFF_F000;

/// Returns the guest frame number containing a physical address.
pub fn gfn_from_pa(pa: Pa) -> Gfn {
    Gfn(pa.0 >> PAGE_SHIFT)
}

/// Returns the physical address of the first byte of a frame.
pub fn pa_from_gfn(gfn: Gfn) -> Pa {
    Pa(gfn.0 << PAGE_SHIFT)
}

/// Returns the offset of a physical address within its frame.
pub fn pa_offset(pa: Pa) -> u64 {
    pa.0 & !PAGE_MASK
}

/// Aligns a virtual address down to its page base.
pub fn va_align_down(va: Va) -> Va {
    va & PAGE_MASK
}

/// Returns the offset of a virtual address within a 4 KiB page.
pub fn va_offset(va: Va) -> u64 {
    va.0 & !PAGE_MASK
}

/// The levels in the page table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageTableLevel {
    /// Page Table (PT) - the lowest level, pointing directly to 4KB pages.
    Pt,

    /// Page Directory (PD) - can point to PTs or 2MB large pages.
    Pd,

    /// Page Directory Pointer Table (PDPT) - can point to PDs or 1GB large
    /// pages.
    Pdpt,

    /// Page Map Level 4 (PML4) - the highest level in 4-level paging.
    Pml4,
}

impl PageTableLevel {
    /// Returns the 9-bit table index a virtual address selects at this
    /// level.
    pub fn va_index(self, va: Va) -> u64 {
        match self {
            Self::Pt => (va.0 >> 12) & 0x1ff,
            Self::Pd => (va.0 >> 21) & 0x1ff,
            Self::Pdpt => (va.0 >> 30) & 0x1ff,
            Self::Pml4 => (va.0 >> 39) & 0x1ff,
        }
    }

    /// Returns the offset of a virtual address within a page mapped at this
    /// level.
    pub fn va_offset(self, va: Va) -> u64 {
        va.0 & (self.page_size() - 1)
    }

    /// Returns the size of a page mapped at this level.
    pub fn page_size(self) -> u64 {
        match self {
            Self::Pt => 0x1000,
            Self::Pd => 0x20_0000,
            Self::Pdpt => 0x4000_0000,
            Self::Pml4 => 0x80_0000_0000,
        }
    }
}

/// A page table entry in the paging structures.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// Checks if the page is present in physical memory.
    pub fn present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the page is writable.
    pub fn write(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }

    /// Checks if this entry refers to a large page.
    pub fn large(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Checks if instruction fetches from the page are disallowed.
    pub fn no_execute(self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Extracts the page frame number from the entry.
    pub fn pfn(self) -> Gfn {
        const BITS: u64 = 40;
        const MASK: u64 = (1 << BITS) - 1;
        Gfn((self.0 >> 12) & MASK)
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("large", &self.large())
            .field("no_execute", &self.no_execute())
            .field("pfn", &self.pfn())
            .finish()
    }
}

/// The leaf mapping of a guest-virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    /// Physical address the virtual address resolves to.
    pub pa: Pa,

    /// Size of the mapping page (4 KiB, 2 MiB or 1 GiB).
    pub page_size: u64,

    /// Whether the leaf entry is present.
    ///
    /// A non-present leaf still carries a frame number (the entry may
    /// describe a transition page); intermediate non-present levels fail
    /// the walk instead.
    pub present: bool,

    /// Whether every level of the walk permits writes.
    pub writable: bool,

    /// Whether every level of the walk permits instruction fetches.
    pub executable: bool,
}

impl PageMapping {
    /// Returns the guest frame number backing the mapping.
    pub fn gfn(&self) -> Gfn {
        gfn_from_pa(self.pa)
    }
}

fn entry_at(page: &[u8], index: u64) -> Result<PageTableEntry, VmiError> {
    let offset = index as usize * size_of::<PageTableEntry>();
    let bytes = page
        .get(offset..offset + size_of::<PageTableEntry>())
        .ok_or(VmiError::OutOfBounds)?;

    PageTableEntry::read_from_bytes(bytes).map_err(|_| VmiError::OutOfBounds)
}

/// Walks the four-level page tables rooted at `root` and returns the leaf
/// mapping of `va`.
///
/// Large-page bits short-circuit the walk at 2 MiB (PD) or 1 GiB (PDPT).
/// Fails with [`VmiError::NotMapped`] when an intermediate level is absent.
pub fn resolve<Driver>(driver: &Driver, root: Pa, va: Va) -> Result<PageMapping, VmiError>
where
    Driver: VmiDriver,
{
    const LEVELS: [PageTableLevel; 4] = [
        PageTableLevel::Pml4,
        PageTableLevel::Pdpt,
        PageTableLevel::Pd,
        PageTableLevel::Pt,
    ];

    let mut table_gfn = gfn_from_pa(root);
    let mut writable = true;
    let mut executable = true;

    for level in LEVELS {
        let page = driver.read_page(table_gfn)?;
        let entry = entry_at(&page, level.va_index(va))?;

        if !entry.present() {
            if level == PageTableLevel::Pt {
                // The leaf entry exists but the page is swapped out.
                return Ok(PageMapping {
                    pa: pa_from_gfn(entry.pfn()) + level.va_offset(va),
                    page_size: level.page_size(),
                    present: false,
                    writable: writable && entry.write(),
                    executable: executable && !entry.no_execute(),
                });
            }

            return Err(VmiError::page_fault((va, root)));
        }

        writable &= entry.write();
        executable &= !entry.no_execute();

        let leaf = match level {
            PageTableLevel::Pt => true,
            PageTableLevel::Pd | PageTableLevel::Pdpt => entry.large(),
            PageTableLevel::Pml4 => false,
        };

        if leaf {
            return Ok(PageMapping {
                pa: pa_from_gfn(entry.pfn()) + level.va_offset(va),
                page_size: level.page_size(),
                present: true,
                writable,
                executable,
            });
        }

        table_gfn = entry.pfn();
    }

    unreachable!("the PT level always terminates the walk");
}
