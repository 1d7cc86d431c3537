//! Kernel-structure profile.
//!
//! The unpacker never hardcodes kernel layouts. A profile maps symbolic
//! field names of the target OS build to byte offsets and, for packed flag
//! words, to bit ranges. It is produced ahead of time (from debug symbols
//! of the guest kernel) and loaded once; after that it is immutable.

use std::{fs::File, io::BufReader, path::Path};

use serde::Deserialize;

use crate::Va;

/// An error that can occur while loading a profile.
#[derive(thiserror::Error, Debug)]
pub enum ProfileError {
    /// The profile file could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The profile file could not be parsed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A bit range is malformed.
    #[error("bit range {0}..={1} is malformed")]
    BitRange(u64, u64),
}

/// An inclusive bit range `[start..=end]` within a packed flag word.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BitRange {
    /// Index of the lowest bit of the field.
    pub start: u64,

    /// Index of the highest bit of the field.
    pub end: u64,
}

impl BitRange {
    /// Extracts the field value from a packed word.
    pub fn extract(&self, word: u64) -> u64 {
        let length = self.end - self.start + 1;
        let mask = if length >= 64 {
            u64::MAX
        }
        else {
            (1u64 << length) - 1
        };

        (word >> self.start) & mask
    }

    fn validate(&self) -> Result<(), ProfileError> {
        if self.start > self.end || self.end >= 64 {
            return Err(ProfileError::BitRange(self.start, self.end));
        }

        Ok(())
    }
}

/// Virtual addresses of the kernel symbols the unpacker consumes.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct KernelSymbols {
    /// Head of the kernel's active-process list.
    pub active_process_head: Va,
}

/// Byte offsets into the process descriptor structure.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProcessOffsets {
    /// Process identifier.
    pub unique_process_id: u64,

    /// Identifier of the creating process.
    pub inherited_from_unique_process_id: u64,

    /// Links of the active-process list.
    pub active_process_links: u64,

    /// Top-level page-table root (physical address).
    pub directory_table_base: u64,

    /// Root of the VAD tree.
    pub vad_root: u64,

    /// Base address of the main image section.
    pub section_base_address: u64,

    /// Short image file name (fixed 15-byte array).
    pub image_file_name: u64,
}

/// Byte offsets into a VAD tree node.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct VadOffsets {
    /// Left child pointer.
    pub left_child: u64,

    /// Right child pointer.
    pub right_child: u64,

    /// First virtual page number of the range.
    pub starting_vpn: u64,

    /// Last virtual page number of the range.
    pub ending_vpn: u64,

    /// Packed flags word.
    pub flags: u64,

    /// Control area pointer.
    pub control_area: u64,
}

/// Byte offsets into the control area structure.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ControlAreaOffsets {
    /// File object pointer (tagged with a fast-reference count in the low
    /// bits).
    pub file_object: u64,
}

/// Byte offsets into the file object structure.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FileObjectOffsets {
    /// File name (a kernel Unicode string).
    pub file_name: u64,
}

/// Byte offsets into the kernel Unicode string structure.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UnicodeStringOffsets {
    /// Length of the string in bytes.
    pub length: u64,

    /// Pointer to the UTF-16 buffer.
    pub buffer: u64,
}

/// Bit ranges within the packed VAD flags word.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct VadFlagRanges {
    /// VAD type field.
    pub vad_type: BitRange,

    /// Private-memory flag.
    pub private_memory: BitRange,

    /// Protection field.
    pub protection: BitRange,
}

/// A read-only mapping from symbolic kernel-structure field names to byte
/// offsets and bit ranges.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    /// Kernel symbol addresses.
    pub kernel: KernelSymbols,

    /// Process descriptor offsets.
    pub process: ProcessOffsets,

    /// VAD node offsets.
    pub vad: VadOffsets,

    /// Control area offsets.
    pub control_area: ControlAreaOffsets,

    /// File object offsets.
    pub file_object: FileObjectOffsets,

    /// Kernel Unicode string offsets.
    pub unicode_string: UnicodeStringOffsets,

    /// VAD flag-word bit ranges.
    pub vad_flags: VadFlagRanges,
}

impl Profile {
    /// Loads a profile from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Loads a profile from a JSON reader.
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, ProfileError> {
        let profile: Self = serde_json::from_reader(reader)?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<(), ProfileError> {
        self.vad_flags.vad_type.validate()?;
        self.vad_flags.private_memory.validate()?;
        self.vad_flags.protection.validate()?;
        Ok(())
    }
}

/// A packed flag word together with the bit ranges that name its fields.
///
/// All bit-level math lives here; call sites ask for fields by name.
#[derive(Debug, Clone, Copy)]
pub struct FlagsWord<'a> {
    word: u64,
    ranges: &'a VadFlagRanges,
}

impl<'a> FlagsWord<'a> {
    /// Creates a new flag word view.
    pub fn new(word: u64, ranges: &'a VadFlagRanges) -> Self {
        Self { word, ranges }
    }

    /// Extracts an arbitrary field.
    pub fn get(&self, range: &BitRange) -> u64 {
        range.extract(self.word)
    }

    /// Returns the VAD type field.
    pub fn vad_type(&self) -> u64 {
        self.get(&self.ranges.vad_type)
    }

    /// Returns the private-memory flag.
    pub fn private_memory(&self) -> bool {
        self.get(&self.ranges.private_memory) != 0
    }

    /// Returns the protection field.
    pub fn protection(&self) -> u64 {
        self.get(&self.ranges.protection)
    }
}
