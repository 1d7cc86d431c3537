//! VAD tree traversal.
//!
//! The guest kernel describes each contiguous range of a process's virtual
//! address space with a Virtual Address Descriptor node in a balanced
//! tree. The walker performs an in-order traversal (ascending base
//! address order) with an explicit worklist instead of recursion, so a
//! pathological guest cannot blow the detector's stack, and a visitor cap
//! is a clean early exit.
//!
//! All structure reads go through the [`Profile`]; nothing about the node
//! layout is hardcoded.

use std::ops::ControlFlow;

use hvunpack_core::{
    Pa, Va, Vmi, VmiDriver, VmiError,
    profile::{FlagsWord, Profile},
};
use once_cell::unsync::OnceCell;
use serde::Serialize;

use crate::dump::MemorySegment;

/// Upper bound on the tree depth the walker follows.
///
/// A balanced tree over the largest possible user address space stays far
/// below this; a deeper spine means the tree is corrupt or adversarial.
pub const VAD_DEPTH_MAX: usize = 128;

/// Virtual page numbers above this bound cannot describe user-mode memory
/// and are treated as a profile mismatch.
const VPN_PLAUSIBLE_MAX: u64 = 1 << 35;

/// The type of memory a VAD describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VadType {
    /// Private (anonymous) memory.
    Private,

    /// A mapped non-image section.
    Mapped,

    /// A mapped image section.
    Image,
}

/// VAD type constant for image mappings in the packed flags word.
const VAD_IMAGE_MAP: u64 = 2;

/// The attributes of one VAD node, extracted through the profile.
#[derive(Debug, Clone)]
pub struct VadInfo {
    /// Kernel address of the node.
    pub node: Va,

    /// First byte of the described range.
    pub base: Va,

    /// First byte past the described range.
    pub end: Va,

    /// The type of the memory.
    pub vad_type: VadType,

    /// Raw 5-bit memory-manager protection value.
    pub protection_raw: u64,

    /// Whether the memory is private to the process.
    pub is_private: bool,

    /// Backing file name, if the node maps a file.
    pub filename: Option<String>,
}

impl VadInfo {
    /// Checks whether the range contains `va`.
    pub fn contains(&self, va: Va) -> bool {
        self.base <= va && va < self.end
    }

    /// Returns the size of the range in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.base
    }
}

/// One node of the guest's VAD tree.
pub struct VadNode<'a, Driver>
where
    Driver: VmiDriver,
{
    vmi: &'a Vmi<Driver>,
    profile: &'a Profile,

    /// Kernel translation root used for all structure reads.
    root: Pa,

    /// Kernel address of the node.
    va: Va,

    /// Cached flags word.
    flags: OnceCell<u64>,
}

impl<'a, Driver> VadNode<'a, Driver>
where
    Driver: VmiDriver,
{
    /// Creates a view of the node at `va`.
    pub fn new(vmi: &'a Vmi<Driver>, profile: &'a Profile, root: Pa, va: Va) -> Self {
        Self {
            vmi,
            profile,
            root,
            va,
            flags: OnceCell::new(),
        }
    }

    /// Returns the kernel address of the node.
    pub fn va(&self) -> Va {
        self.va
    }

    /// Returns the left child, if any.
    pub fn left_child(&self) -> Result<Option<Va>, VmiError> {
        let child = self
            .vmi
            .read_va(self.root, self.va + self.profile.vad.left_child)?;
        Ok((!child.is_null()).then_some(child))
    }

    /// Returns the right child, if any.
    pub fn right_child(&self) -> Result<Option<Va>, VmiError> {
        let child = self
            .vmi
            .read_va(self.root, self.va + self.profile.vad.right_child)?;
        Ok((!child.is_null()).then_some(child))
    }

    /// Returns the first virtual page number of the range.
    pub fn starting_vpn(&self) -> Result<u64, VmiError> {
        self.vmi
            .read_u64(self.root, self.va + self.profile.vad.starting_vpn)
    }

    /// Returns the last virtual page number of the range.
    pub fn ending_vpn(&self) -> Result<u64, VmiError> {
        self.vmi
            .read_u64(self.root, self.va + self.profile.vad.ending_vpn)
    }

    /// Returns the packed flags word.
    ///
    /// The value is cached after the first read.
    pub fn flags(&self) -> Result<FlagsWord<'a>, VmiError> {
        let word = self
            .flags
            .get_or_try_init(|| self.vmi.read_u64(self.root, self.va + self.profile.vad.flags))
            .copied()?;

        Ok(FlagsWord::new(word, &self.profile.vad_flags))
    }

    /// Returns the VAD type field of the flags word.
    pub fn vad_type(&self) -> Result<VadType, VmiError> {
        let flags = self.flags()?;

        if flags.vad_type() == VAD_IMAGE_MAP {
            return Ok(VadType::Image);
        }

        if flags.private_memory() {
            return Ok(VadType::Private);
        }

        Ok(VadType::Mapped)
    }

    /// Returns the private-memory flag.
    pub fn private_memory(&self) -> Result<bool, VmiError> {
        Ok(self.flags()?.private_memory())
    }

    /// Returns the raw protection field.
    pub fn protection(&self) -> Result<u64, VmiError> {
        Ok(self.flags()?.protection())
    }

    /// Returns the backing file name, if the node maps a file.
    ///
    /// The control area's file-object pointer carries a fast-reference
    /// count in its low three bits, which are masked before the pointer is
    /// followed.
    pub fn filename(&self) -> Result<Option<String>, VmiError> {
        let control_area = self
            .vmi
            .read_va(self.root, self.va + self.profile.vad.control_area)?;
        if control_area.is_null() {
            return Ok(None);
        }

        let file_object = self
            .vmi
            .read_va(self.root, control_area + self.profile.control_area.file_object)?;
        let file_object = file_object & !0x7;
        if file_object.is_null() {
            return Ok(None);
        }

        self.vmi.read_unicode_string(
            &self.profile.unicode_string,
            self.root,
            file_object + self.profile.file_object.file_name,
        )
    }

    /// Extracts the node's attributes.
    ///
    /// Returns `None` for nodes that do not describe a usable range: a
    /// zero starting or ending VPN, or VPN values no user-mode range can
    /// have (a profile mismatch).
    pub fn describe(&self) -> Result<Option<VadInfo>, VmiError> {
        let starting_vpn = self.starting_vpn()?;
        let ending_vpn = self.ending_vpn()?;

        if starting_vpn == 0 || ending_vpn == 0 {
            return Ok(None);
        }

        if starting_vpn >= VPN_PLAUSIBLE_MAX || ending_vpn >= VPN_PLAUSIBLE_MAX {
            tracing::warn!(
                node = %self.va,
                starting_vpn,
                ending_vpn,
                "implausible VPN range, skipping node"
            );
            return Ok(None);
        }

        let base = Va(starting_vpn << 12);
        let end = Va(ending_vpn << 12);
        if end <= base {
            return Ok(None);
        }

        let filename = match self.filename() {
            Ok(filename) => filename,
            Err(err) => {
                tracing::warn!(node = %self.va, ?err, "failed to read backing filename");
                None
            }
        };

        Ok(Some(VadInfo {
            node: self.va,
            base,
            end,
            vad_type: self.vad_type()?,
            protection_raw: self.protection()?,
            is_private: self.private_memory()?,
            filename,
        }))
    }
}

/// A visitor over VAD nodes.
///
/// Returning [`ControlFlow::Break`] stops the traversal early.
pub trait VadVisitor<Driver>
where
    Driver: VmiDriver,
{
    /// Visits one node, in ascending base-address order.
    fn visit(&mut self, node: &VadNode<'_, Driver>) -> ControlFlow<()>;
}

/// Performs an in-order traversal of the VAD tree rooted at `vad_root`.
///
/// An unreadable child pointer is logged and its subtree skipped; the rest
/// of the tree is still visited.
pub fn walk<Driver>(
    vmi: &Vmi<Driver>,
    profile: &Profile,
    kernel_root: Pa,
    vad_root: Va,
    visitor: &mut impl VadVisitor<Driver>,
) where
    Driver: VmiDriver,
{
    let mut stack: Vec<Va> = Vec::new();
    let mut current = (!vad_root.is_null()).then_some(vad_root);

    loop {
        // Push the left spine of the current subtree.
        while let Some(va) = current {
            if stack.len() >= VAD_DEPTH_MAX {
                tracing::warn!(node = %va, "tree deeper than supported, truncating");
                break;
            }

            stack.push(va);

            let node = VadNode::new(vmi, profile, kernel_root, va);
            current = match node.left_child() {
                Ok(left) => left,
                Err(err) => {
                    tracing::error!(node = %va, ?err, "failed to read left child");
                    None
                }
            };
        }

        let va = match stack.pop() {
            Some(va) => va,
            None => break,
        };

        let node = VadNode::new(vmi, profile, kernel_root, va);
        if visitor.visit(&node).is_break() {
            break;
        }

        current = match node.right_child() {
            Ok(right) => right,
            Err(err) => {
                tracing::error!(node = %va, ?err, "failed to read right child");
                None
            }
        };
    }
}

/// Finds the VAD segment containing `va` by descending the tree by range.
pub fn find_segment<Driver>(
    vmi: &Vmi<Driver>,
    profile: &Profile,
    kernel_root: Pa,
    vad_root: Va,
    va: Va,
) -> Result<Option<VadInfo>, VmiError>
where
    Driver: VmiDriver,
{
    let mut current = (!vad_root.is_null()).then_some(vad_root);
    let mut depth = 0usize;

    while let Some(node_va) = current {
        if depth >= VAD_DEPTH_MAX {
            tracing::warn!(node = %node_va, "tree deeper than supported, giving up");
            return Ok(None);
        }
        depth += 1;

        let node = VadNode::new(vmi, profile, kernel_root, node_va);
        let info = node.describe()?;

        current = match info {
            Some(info) if info.contains(va) => return Ok(Some(info)),
            Some(info) if va < info.base => node.left_child()?,
            Some(_) => node.right_child()?,
            // A node without a usable range gives no ordering hint.
            None => node.right_child()?,
        };
    }

    Ok(None)
}

/// Collects every VAD segment of a process into owned memory segments.
///
/// Segment contents are read through the process's own translation root;
/// short reads shrink the captured buffer and are logged. Collection stops
/// at the configured cap with a warning.
pub struct SegmentCollector<'a, Driver>
where
    Driver: VmiDriver,
{
    vmi: &'a Vmi<Driver>,

    /// Translation root of the monitored process.
    process_root: Pa,

    max_segments: usize,
    segments: Vec<MemorySegment>,
    capped: bool,
}

impl<'a, Driver> SegmentCollector<'a, Driver>
where
    Driver: VmiDriver,
{
    /// Creates a collector reading contents through `process_root`.
    pub fn new(vmi: &'a Vmi<Driver>, process_root: Pa, max_segments: usize) -> Self {
        Self {
            vmi,
            process_root,
            max_segments,
            segments: Vec::new(),
            capped: false,
        }
    }

    /// Returns the collected segments.
    pub fn into_segments(self) -> Vec<MemorySegment> {
        self.segments
    }

    fn collect(&self, node: &VadNode<'_, Driver>) -> Result<Option<MemorySegment>, VmiError> {
        let info = match node.describe()? {
            Some(info) => info,
            None => return Ok(None),
        };

        let size = info.size();
        let mut data = vec![0u8; size as usize];
        let read = self.vmi.read_partial(self.process_root, info.base, &mut data)?;

        if (read as u64) < size {
            tracing::warn!(
                base = %info.base,
                size,
                read,
                "segment partially unreadable, truncating"
            );
            data.truncate(read);
        }

        Ok(Some(MemorySegment {
            base: info.base,
            va_size: size,
            vad_type: info.vad_type,
            protection: crate::classify::protection::decode(info.protection_raw),
            is_private: info.is_private,
            filename: info.filename,
            data,
        }))
    }
}

impl<Driver> VadVisitor<Driver> for SegmentCollector<'_, Driver>
where
    Driver: VmiDriver,
{
    fn visit(&mut self, node: &VadNode<'_, Driver>) -> ControlFlow<()> {
        if self.segments.len() >= self.max_segments {
            if !self.capped {
                tracing::warn!(
                    max_segments = self.max_segments,
                    "segment cap reached, dropping remaining regions"
                );
                self.capped = true;
            }
            return ControlFlow::Break(());
        }

        match self.collect(node) {
            Ok(Some(segment)) => self.segments.push(segment),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(node = %node.va(), ?err, "failed to capture segment");
            }
        }

        ControlFlow::Continue(())
    }
}
