//! Backing nodes: the page frames behind one or more mapped areas.

use alloc::sync::Arc;
use core::{
    cmp,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use constants::{NODE_MAX_PAGES, PAGE_SIZE};
use log::warn;
use usize_conversions::usize_from;

use crate::{
    error::{Result, bail, ensure},
    platform::{BackingFile, page_allocator},
};

/// How a node populates its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// File contents are read at construction.
    Eager,
    /// File contents are read at the first fault.
    OnDemand,
}

/// A file region backing a node. Bytes past `len` up to the end of the
/// node are zero-filled.
pub struct FileBacking {
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
    pub len: u64,
}

/// A fixed-capacity array of page frames, shared between areas through
/// reference counting.
///
/// Each slot starts out empty and is published exactly once with a
/// compare-exchange; once set, a slot stays unchanged until the node is
/// destroyed. This lets faulting threads populate different pages of the
/// same node in parallel.
pub struct VmNode {
    npages: usize,
    kind: NodeKind,
    backing: Option<FileBacking>,
    pages: [AtomicPtr<u8>; NODE_MAX_PAGES],
}

// SAFETY: Frames are exclusively owned by the node and all slot accesses
// go through atomics.
unsafe impl Send for VmNode {}
unsafe impl Sync for VmNode {}

impl core::fmt::Debug for VmNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmNode")
            .field("npages", &self.npages)
            .field("kind", &self.kind)
            .field("backing", &self.backing.is_some())
            .finish()
    }
}

impl VmNode {
    /// Create a node for `npages` frames. An eager file-backed node
    /// allocates and loads all frames immediately.
    pub fn new(npages: usize, kind: NodeKind, backing: Option<FileBacking>) -> Result<Arc<Self>> {
        ensure!(npages <= NODE_MAX_PAGES, OutOfCapacity);

        let node = Arc::new(Self {
            npages,
            kind,
            backing,
            pages: [const { AtomicPtr::new(ptr::null_mut()) }; NODE_MAX_PAGES],
        });

        if kind == NodeKind::Eager && node.backing.is_some() {
            node.alloc_pages()?;
            node.demand_load()?;
        }

        Ok(node)
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The frame at `index`, if it was populated already.
    pub fn page(&self, index: usize) -> Option<NonNull<u8>> {
        NonNull::new(self.pages[index].load(Ordering::SeqCst))
    }

    /// Make sure every slot holds a frame.
    ///
    /// When the allocator runs dry the node is left half-filled; the slots
    /// populated so far stay valid and a later call completes the rest.
    pub fn alloc_pages(&self) -> Result<()> {
        let allocator = page_allocator();

        for slot in &self.pages[..self.npages] {
            if !slot.load(Ordering::SeqCst).is_null() {
                continue;
            }

            let Some(page) = allocator.alloc_page() else {
                warn!("page allocation failed, leaving node half-filled");
                bail!(OutOfMemory);
            };
            unsafe {
                // SAFETY: A freshly allocated frame is exclusively ours.
                ptr::write_bytes(page.as_ptr(), 0, usize_from(PAGE_SIZE));
            }

            if slot
                .compare_exchange(
                    ptr::null_mut(),
                    page.as_ptr(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                // Another thread published this slot first.
                unsafe {
                    // SAFETY: The frame was never shared.
                    allocator.free_page(page);
                }
            }
        }

        Ok(())
    }

    /// Read the backing region into the node's frames.
    ///
    /// All frames must be populated. Concurrent loads overwrite each other
    /// with identical bytes; the backing file changing underneath a live
    /// mapping makes the winner unpredictable.
    pub fn demand_load(&self) -> Result<()> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };

        let mut done = 0;
        while done < backing.len {
            let page = self
                .page(usize_from(done / PAGE_SIZE))
                .expect("demand load into an unpopulated node");
            let chunk = cmp::min(backing.len - done, PAGE_SIZE);

            let buf = unsafe {
                // SAFETY: The frame is page sized and owned by the node.
                core::slice::from_raw_parts_mut(page.as_ptr(), usize_from(chunk))
            };
            let n = backing.file.read_at(buf, backing.offset + done)?;
            ensure!(n == usize_from(chunk), Io);

            done += chunk;
        }

        Ok(())
    }

    /// Deep-copy the node.
    ///
    /// A node whose first frame was never populated has no populated frames
    /// at all; its copy starts out empty and is filled on the next fault.
    /// Otherwise every populated slot is copied and empty slots stay empty.
    /// Only on-demand nodes keep a handle to the backing file.
    pub fn copy(&self) -> Result<Arc<Self>> {
        let backing = match (self.kind, &self.backing) {
            (NodeKind::OnDemand, Some(backing)) => Some(FileBacking {
                file: backing.file.clone(),
                offset: backing.offset,
                len: backing.len,
            }),
            _ => None,
        };

        let copy = Arc::new(Self {
            npages: self.npages,
            kind: self.kind,
            backing,
            pages: [const { AtomicPtr::new(ptr::null_mut()) }; NODE_MAX_PAGES],
        });

        if self.page(0).is_none() {
            return Ok(copy);
        }

        let allocator = page_allocator();
        for (slot, copy_slot) in self.pages[..self.npages]
            .iter()
            .zip(&copy.pages[..self.npages])
        {
            let source = slot.load(Ordering::SeqCst);
            if source.is_null() {
                continue;
            }

            let Some(page) = allocator.alloc_page() else {
                warn!("node copy failed, out of memory");
                bail!(OutOfMemory);
            };
            unsafe {
                // SAFETY: Source and destination are distinct page-sized
                // frames; the source slot is immutable once published.
                ptr::copy_nonoverlapping(source, page.as_ptr(), usize_from(PAGE_SIZE));
            }
            // The copy isn't shared yet; no other thread races this slot.
            copy_slot.store(page.as_ptr(), Ordering::SeqCst);
        }

        Ok(copy)
    }
}

impl Drop for VmNode {
    fn drop(&mut self) {
        let allocator = page_allocator();
        for slot in &mut self.pages[..self.npages] {
            if let Some(page) = NonNull::new(*slot.get_mut()) {
                unsafe {
                    // SAFETY: The node exclusively owns its frames and is
                    // going away.
                    allocator.free_page(page);
                }
            }
        }
    }
}
