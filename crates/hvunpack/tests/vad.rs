//! VAD traversal against a synthesized guest tree.

mod common;

use std::ops::ControlFlow;

use hvunpack::vad::{self, SegmentCollector, VadNode, VadVisitor};
use hvunpack_core::{Va, Vmi, VmiDriver};

use crate::common::{
    Guest, KERNEL_ROOT, MM_EXECUTE_READWRITE, MM_READWRITE, MockDriver, VAD_IMAGE, VAD_PRIVATE,
    vad_flags,
};

const SEGMENT_CAP: usize = 1024;

#[test]
fn in_order_traversal_is_ascending() {
    let mut guest = Guest::new();

    // Balanced three-node tree inserted out of address order.
    let middle = guest.vad_node(0x600, 0x601, vad_flags(VAD_PRIVATE, true, MM_READWRITE), None);
    let low = guest.vad_node(0x400, 0x500, vad_flags(VAD_IMAGE, false, MM_EXECUTE_READWRITE), None);
    let high = guest.vad_node(0x800, 0x810, vad_flags(VAD_PRIVATE, true, MM_READWRITE), None);
    guest.set_children(middle, Some(low), Some(high));

    let profile = common::profile();
    let vmi = Vmi::new(&guest.driver);

    let mut collector = SegmentCollector::new(&vmi, KERNEL_ROOT, SEGMENT_CAP);
    vad::walk(&vmi, &profile, KERNEL_ROOT, middle, &mut collector);

    let segments = collector.into_segments();
    assert_eq!(segments.len(), 3);
    assert_eq!(segments[0].base, Va(0x40_0000));
    assert_eq!(segments[1].base, Va(0x60_0000));
    assert_eq!(segments[2].base, Va(0x80_0000));
    assert!(segments.windows(2).all(|pair| pair[0].base < pair[1].base));
}

#[test]
fn segment_count_is_capped() {
    let mut guest = Guest::new();

    // A 2000-node chain of single-page regions, ascending to the right.
    let mut nodes = Vec::with_capacity(2000);
    for i in 0..2000u64 {
        let svpn = 0x1000 + i * 2;
        nodes.push(guest.vad_node(
            svpn,
            svpn + 1,
            vad_flags(VAD_PRIVATE, true, MM_READWRITE),
            None,
        ));
    }
    for pair in nodes.windows(2) {
        guest.set_children(pair[0], None, Some(pair[1]));
    }

    let profile = common::profile();
    let vmi = Vmi::new(&guest.driver);

    let mut collector = SegmentCollector::new(&vmi, KERNEL_ROOT, SEGMENT_CAP);
    vad::walk(&vmi, &profile, KERNEL_ROOT, nodes[0], &mut collector);

    let segments = collector.into_segments();
    assert_eq!(segments.len(), SEGMENT_CAP);
    assert!(segments.windows(2).all(|pair| pair[0].base < pair[1].base));
    assert_eq!(segments[0].base, Va(0x1000 << 12));
}

#[test]
fn unreadable_child_skips_subtree_only() {
    let mut guest = Guest::new();

    let root = guest.vad_node(0x600, 0x601, vad_flags(VAD_PRIVATE, true, MM_READWRITE), None);
    let right = guest.vad_node(0x800, 0x810, vad_flags(VAD_PRIVATE, true, MM_READWRITE), None);
    guest.set_children(root, None, Some(right));

    // The left child pointer leads into unmapped kernel memory.
    guest.driver.write_virt(
        KERNEL_ROOT,
        root + common::profile().vad.left_child,
        &0xffff_9000_dead_0000u64.to_le_bytes(),
    );

    let profile = common::profile();
    let vmi = Vmi::new(&guest.driver);

    let mut collector = SegmentCollector::new(&vmi, KERNEL_ROOT, SEGMENT_CAP);
    vad::walk(&vmi, &profile, KERNEL_ROOT, root, &mut collector);

    // The corrupt subtree is dropped; the node and its right subtree
    // survive.
    let segments = collector.into_segments();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].base, Va(0x60_0000));
    assert_eq!(segments[1].base, Va(0x80_0000));
}

#[test]
fn zero_vpn_nodes_are_skipped() {
    let mut guest = Guest::new();

    let root = guest.vad_node(0, 0, vad_flags(VAD_PRIVATE, true, MM_READWRITE), None);
    let right = guest.vad_node(0x800, 0x810, vad_flags(VAD_PRIVATE, true, MM_READWRITE), None);
    guest.set_children(root, None, Some(right));

    let profile = common::profile();
    let vmi = Vmi::new(&guest.driver);

    let mut collector = SegmentCollector::new(&vmi, KERNEL_ROOT, SEGMENT_CAP);
    vad::walk(&vmi, &profile, KERNEL_ROOT, root, &mut collector);

    let segments = collector.into_segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].base, Va(0x80_0000));
}

#[test]
fn captured_contents_shrink_to_resident_pages() {
    let mut guest = Guest::new();

    let node = guest.vad_node(0x400, 0x404, vad_flags(VAD_PRIVATE, true, MM_READWRITE), None);

    // Two of four pages resident.
    guest.driver.map_page(KERNEL_ROOT, Va(0x40_0000), MockDriver::RW);
    guest.driver.map_page(KERNEL_ROOT, Va(0x40_1000), MockDriver::RW);
    guest
        .driver
        .write_virt(KERNEL_ROOT, Va(0x40_0000), &[0x41; 0x2000]);

    let profile = common::profile();
    let vmi = Vmi::new(&guest.driver);

    let mut collector = SegmentCollector::new(&vmi, KERNEL_ROOT, SEGMENT_CAP);
    vad::walk(&vmi, &profile, KERNEL_ROOT, node, &mut collector);

    let segments = collector.into_segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].va_size, 0x4000);
    assert_eq!(segments[0].data.len(), 0x2000);
    assert!(segments[0].data.iter().all(|&b| b == 0x41));
}

#[test]
fn filename_read_masks_fast_reference_tag() {
    let mut guest = Guest::new();

    let file = guest.file_object("\\Windows\\System32\\evil.dll");
    // The builder tags the control area's file-object pointer with a
    // nonzero fast-reference count.
    let node = guest.vad_node(
        0x7ffa_0000,
        0x7ffa_0010,
        vad_flags(VAD_IMAGE, false, MM_EXECUTE_READWRITE),
        Some(file),
    );

    let profile = common::profile();
    let vmi = Vmi::new(&guest.driver);

    let node = VadNode::new(&vmi, &profile, KERNEL_ROOT, node);
    assert_eq!(
        node.filename().unwrap().as_deref(),
        Some("\\Windows\\System32\\evil.dll")
    );
}

#[test]
fn find_segment_locates_containing_vad() {
    let mut guest = Guest::new();

    let middle = guest.vad_node(0x600, 0x601, vad_flags(VAD_PRIVATE, true, MM_READWRITE), None);
    let low = guest.vad_node(0x400, 0x500, vad_flags(VAD_IMAGE, false, MM_EXECUTE_READWRITE), None);
    let high = guest.vad_node(0x800, 0x810, vad_flags(VAD_PRIVATE, true, MM_READWRITE), None);
    guest.set_children(middle, Some(low), Some(high));

    let profile = common::profile();
    let vmi = Vmi::new(&guest.driver);

    let info = vad::find_segment(&vmi, &profile, KERNEL_ROOT, middle, Va(0x48_1234))
        .unwrap()
        .unwrap();
    assert_eq!(info.base, Va(0x40_0000));
    assert_eq!(info.end, Va(0x50_0000));

    let info = vad::find_segment(&vmi, &profile, KERNEL_ROOT, middle, Va(0x80_f000))
        .unwrap()
        .unwrap();
    assert_eq!(info.base, Va(0x80_0000));

    // Outside every region.
    assert!(
        vad::find_segment(&vmi, &profile, KERNEL_ROOT, middle, Va(0x70_0000))
            .unwrap()
            .is_none()
    );
}

#[test]
fn visitor_break_stops_traversal() {
    struct CountTo {
        remaining: usize,
        visited: usize,
    }

    impl<Driver> VadVisitor<Driver> for CountTo
    where
        Driver: VmiDriver,
    {
        fn visit(&mut self, _node: &VadNode<'_, Driver>) -> ControlFlow<()> {
            self.visited += 1;
            self.remaining -= 1;
            if self.remaining == 0 {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }
    }

    let mut guest = Guest::new();
    let mut nodes = Vec::new();
    for i in 0..8u64 {
        let svpn = 0x1000 + i;
        nodes.push(guest.vad_node(
            svpn,
            svpn + 1,
            vad_flags(VAD_PRIVATE, true, MM_READWRITE),
            None,
        ));
    }
    for pair in nodes.windows(2) {
        guest.set_children(pair[0], None, Some(pair[1]));
    }

    let profile = common::profile();
    let vmi = Vmi::new(&guest.driver);

    let mut visitor = CountTo {
        remaining: 3,
        visited: 0,
    };
    vad::walk(&vmi, &profile, KERNEL_ROOT, nodes[0], &mut visitor);
    assert_eq!(visitor.visited, 3);
}
