//! Page classification.
//!
//! Each faulting page is assigned a category from the VAD segment that
//! contains it. The category drives the filter policy: by default only
//! code and unknown pages participate in the write-then-execute machine,
//! so library loads, heap churn and stack traffic do not drown the
//! detector.

use hvunpack_core::{MemoryAccess, Va};

use crate::vad::{VadInfo, VadType};

/// Memory-manager protection constants, as encoded in the 5-bit VAD
/// protection field.
pub mod protection {
    /// No access.
    pub const MM_ZERO_ACCESS: u64 = 0;
    /// Read-only.
    pub const MM_READONLY: u64 = 1;
    /// Execute-only.
    pub const MM_EXECUTE: u64 = 2;
    /// Execute + read.
    pub const MM_EXECUTE_READ: u64 = 3;
    /// Read + write.
    pub const MM_READWRITE: u64 = 4;
    /// Copy-on-write.
    pub const MM_WRITECOPY: u64 = 5;
    /// Execute + read + write.
    pub const MM_EXECUTE_READWRITE: u64 = 6;
    /// Execute + copy-on-write.
    pub const MM_EXECUTE_WRITECOPY: u64 = 7;

    /// Guard modifier bit.
    pub const MM_GUARD: u64 = 0x10;

    /// Decodes the access part of a protection value.
    pub fn decode(value: u64) -> super::MemoryAccess {
        use super::MemoryAccess;

        match value & 0x7 {
            MM_ZERO_ACCESS => MemoryAccess::default(),
            MM_READONLY => MemoryAccess::R,
            MM_EXECUTE => MemoryAccess::X,
            MM_EXECUTE_READ => MemoryAccess::RX,
            MM_READWRITE => MemoryAccess::RW,
            MM_WRITECOPY => MemoryAccess::RW,
            MM_EXECUTE_READWRITE => MemoryAccess::RWX,
            MM_EXECUTE_WRITECOPY => MemoryAccess::RWX,
            _ => MemoryAccess::default(),
        }
    }

    /// Checks the guard modifier of a protection value.
    pub fn is_guard(value: u64) -> bool {
        value & MM_GUARD != 0
    }
}

/// The category of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCategory {
    /// Executable page of the main image.
    Code,

    /// Non-executable mapped data.
    Data,

    /// Private (anonymous) memory.
    Heap,

    /// Stack or guard region.
    Stack,

    /// File-backed image mapping other than the main image.
    Library,

    /// No VAD describes the page.
    Unknown,
}

/// Which optional page categories participate in detection.
///
/// Code and unknown pages always participate; data pages never do.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilterPolicy {
    /// Instrument file-backed library mappings.
    pub libraries: bool,

    /// Instrument private heap memory.
    pub heap: bool,

    /// Instrument stack and guard regions.
    pub stack: bool,
}

impl FilterPolicy {
    /// Checks whether pages of `category` participate in detection.
    pub fn monitored(&self, category: PageCategory) -> bool {
        match category {
            PageCategory::Code | PageCategory::Unknown => true,
            PageCategory::Library => self.libraries,
            PageCategory::Heap => self.heap,
            PageCategory::Stack => self.stack,
            PageCategory::Data => false,
        }
    }
}

/// Classifies a page from the VAD segment containing it.
///
/// `image_base` is the base of the process main image; a file-backed image
/// mapping elsewhere is a library.
///
/// Rules are evaluated in order, first match wins.
pub fn classify(vad: Option<&VadInfo>, image_base: Va) -> PageCategory {
    let vad = match vad {
        Some(vad) => vad,
        None => return PageCategory::Unknown,
    };

    let is_image = vad.vad_type == VadType::Image;
    let is_main_image = is_image && vad.contains(image_base);

    if vad.filename.is_some() && is_image && !is_main_image {
        return PageCategory::Library;
    }

    if protection::is_guard(vad.protection_raw) {
        return PageCategory::Stack;
    }

    if vad.is_private && !is_image {
        return PageCategory::Heap;
    }

    if is_image && protection::decode(vad.protection_raw).contains(MemoryAccess::X) {
        return PageCategory::Code;
    }

    PageCategory::Data
}
