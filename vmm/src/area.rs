//! Mapped areas: a contiguous user address range bound to a backing node.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use constants::{PAGE_SIZE, USER_CEILING};
use usize_conversions::usize_from;
use x86_64::VirtAddr;

use crate::{error::{Result, ensure}, node::VmNode};

/// The mapping mode of an area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaMode {
    /// The node is exclusively owned; faults map pages writable.
    Private,
    /// The node is shared copy-on-write; the first write splits it.
    Cow,
}

/// A half-open range `[start, end)` of mapped user virtual addresses.
///
/// Areas are immutable after publication except for the deletion
/// tombstone. Every mutation replaces the whole area with a fresh one; the
/// tombstone tells readers still holding the old area that it lost its
/// place in the map.
pub struct VmArea {
    start: VirtAddr,
    end: VirtAddr,
    mode: AreaMode,
    node: Arc<VmNode>,
    deleted: AtomicBool,
}

impl core::fmt::Debug for VmArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmArea")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("mode", &self.mode)
            .field("deleted", &self.deleted.load(Ordering::Relaxed))
            .finish()
    }
}

impl VmArea {
    pub fn new(start: VirtAddr, end: VirtAddr, mode: AreaMode, node: Arc<VmNode>) -> Result<Self> {
        ensure!(start.is_aligned(PAGE_SIZE), BadAddress);
        ensure!(end.is_aligned(PAGE_SIZE), BadAddress);
        // This also rejects an end that wrapped past the top of the
        // address space.
        ensure!(start < end, BadAddress);
        ensure!(end.as_u64() <= USER_CEILING, BadAddress);

        Ok(Self {
            start,
            end,
            mode,
            node,
            deleted: AtomicBool::new(false),
        })
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn end(&self) -> VirtAddr {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn mode(&self) -> AreaMode {
        self.mode
    }

    pub fn node(&self) -> &Arc<VmNode> {
        &self.node
    }

    /// Whether the area intersects `[start, start + len)`.
    pub fn overlaps(&self, start: VirtAddr, len: u64) -> bool {
        self.start.as_u64() < start.as_u64() + len && start < self.end
    }

    /// The frame index within the node backing `va`.
    pub fn page_index(&self, va: VirtAddr) -> usize {
        usize_from((va.align_down(PAGE_SIZE) - self.start) / PAGE_SIZE)
    }

    /// Whether the area was replaced or removed after the caller looked it
    /// up.
    pub fn deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }
}
