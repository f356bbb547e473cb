//! Per-process address spaces and the page-fault state machine.

use alloc::{boxed::Box, sync::Arc};
use core::{cmp, ptr::NonNull};

use constants::{PAGE_SIZE, USER_CEILING};
use log::{debug, warn};
use usize_conversions::{FromUsize, usize_from};
use x86_64::{VirtAddr, structures::idt::PageFaultErrorCode};

use crate::{
    area::{AreaMode, VmArea},
    epoch::{self, EpochGuard},
    error::{Result, bail, ensure},
    mmu::{self, Pml, Pte, PteFlags, update_pages},
    node::{NodeKind, VmNode},
    platform::{self, Slab, slab_allocator},
    range_map::RangeMap,
};

/// The outcome of a resolved page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FaultResolution {
    /// Another CPU published a valid translation first.
    AlreadyValid,
    /// A new translation was published for the faulting address.
    Fixed,
}

/// A per-process virtual address space.
///
/// Owns the hardware page-table root, the per-address-space kernel-shared
/// region and the map of areas. All operations may run concurrently on
/// multiple CPUs; there is no address-space-wide lock.
pub struct AddressSpace {
    ranges: RangeMap,
    pml: Pml,
    kshared: NonNull<u8>,
}

// SAFETY: The kshared region is only handed to the MMU; the remaining
// state synchronizes internally.
unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    /// Set up an empty address space with the shared kernel mappings and a
    /// fresh kernel-shared region installed.
    pub fn new() -> Result<Self> {
        let mmu = mmu::mmu();

        let Some(pml) = mmu.new_kernel_pml() else {
            warn!("address space setup: out of memory for the page-table root");
            bail!(OutOfMemory);
        };
        let Some(kshared) = slab_allocator().slab_alloc(Slab::KShared) else {
            warn!("address space setup: out of memory for the kshared region");
            unsafe {
                // SAFETY: The root was never installed anywhere.
                mmu.free_pml(&pml);
            }
            bail!(OutOfMemory);
        };
        if mmu.install_kshared(&pml, kshared).is_err() {
            warn!("address space setup: failed to install the kshared region");
            unsafe {
                // SAFETY: Releasing the components acquired above.
                slab_allocator().slab_free(Slab::KShared, kshared);
                mmu.free_pml(&pml);
            }
            bail!(OutOfMemory);
        }

        Ok(Self {
            ranges: RangeMap::new(),
            pml,
            kshared,
        })
    }

    /// Map `node` at `start`. The target range must be empty.
    ///
    /// The node moves into the new area; on error it is released.
    pub fn insert(&self, node: Arc<VmNode>, start: VirtAddr, do_tlb: bool) -> Result<()> {
        let len = u64::from_usize(node.npages()) * PAGE_SIZE;
        mmu::check_user_range(start, len)?;
        let end = start + len;
        let area = VmArea::new(start, end, AreaMode::Private, node)?;

        {
            // Release the span lock before touching the page table.
            let span = self.ranges.search_lock(start, len);
            let guard = epoch::pin();
            if let Some(existing) = span.iter(&guard).next() {
                debug!(
                    target: "vmm::map",
                    "insert at {start:?} overlaps {:?}..{:?}",
                    existing.start(), existing.end(),
                );
                bail!(Overlap);
            }
            span.replace(Some(Box::new(area)));
        }

        let needs_flush = self.clear_range(start, end);
        if needs_flush && do_tlb {
            mmu::mmu().tlb_flush();
        }
        Ok(())
    }

    /// Unmap `[start, start + len)`. Every area in the range must be fully
    /// contained in it; partial unmaps are refused without touching
    /// anything.
    pub fn remove(&self, start: VirtAddr, len: u64) -> Result<()> {
        mmu::check_user_range(start, len)?;
        let end = start + len;

        {
            // Release the span lock before touching the page table.
            let span = self.ranges.search_lock(start, len);
            let guard = epoch::pin();
            for area in span.iter(&guard) {
                if area.start() < start || area.end() > end {
                    debug!(
                        target: "vmm::map",
                        "partial unmap of {:?}..{:?} not supported",
                        area.start(), area.end(),
                    );
                    bail!(PartialUnmap);
                }
            }
            span.replace(None);
        }

        if self.clear_range(start, end) {
            mmu::mmu().tlb_flush();
        }
        Ok(())
    }

    /// Find an area overlapping `[start, start + len)`. The reference
    /// stays valid for the lifetime of the caller's epoch guard. Wrapping
    /// queries match nothing.
    pub fn lookup<'g>(
        &self,
        start: VirtAddr,
        len: u64,
        guard: &'g EpochGuard,
    ) -> Option<&'g VmArea> {
        self.ranges.search(start, len, guard)
    }

    /// Duplicate the address space. With `share` the copy references the
    /// same nodes copy-on-write and the originals are demoted to
    /// copy-on-write as well; otherwise every node is deep-copied.
    pub fn copy(&self, share: bool) -> Result<AddressSpace> {
        let new = AddressSpace::new()?;

        let guard = epoch::pin();
        for area in self.ranges.iter(&guard) {
            let child = if share {
                if area.mode() != AreaMode::Cow {
                    // Demote the original mapping to copy-on-write. A
                    // racing removal wins; the copy simply keeps its own
                    // reference to the node.
                    let replacement = VmArea::new(
                        area.start(),
                        area.end(),
                        AreaMode::Cow,
                        area.node().clone(),
                    )?;
                    self.replace_vma(area, Box::new(replacement));
                    update_pages(&self.pml, area.start(), area.end(), demote_writable);
                }
                VmArea::new(area.start(), area.end(), AreaMode::Cow, area.node().clone())?
            } else {
                let node = area.node().copy()?;
                VmArea::new(area.start(), area.end(), AreaMode::Private, node)?
            };

            let span = new.ranges.search_lock(child.start(), child.len());
            assert!(span.iter(&guard).next().is_none());
            span.replace(Some(Box::new(child)));
        }

        if share {
            // The original's writable entries changed; every CPU must
            // re-walk.
            mmu::mmu().tlb_flush();
        }

        Ok(new)
    }

    /// Resolve a fault at `va` into a valid translation.
    ///
    /// Runs concurrently with every other operation on the address space;
    /// lost races restart the resolution from the current entry value.
    ///
    /// # Panics
    ///
    /// Panics when the kernel cannot allocate frames or load the backing
    /// store mid-fault; there is no graceful return out of the fault path.
    pub fn page_fault(&self, va: VirtAddr, error_code: PageFaultErrorCode) -> Result<FaultResolution> {
        ensure!(va.as_u64() < USER_CEILING, Fault);

        let mmu = mmu::mmu();
        let Some(pte) = mmu.walk(&self.pml, va, true) else {
            panic!("page fault: out of memory walking the page table for {va:?}");
        };

        loop {
            let ptev = pte.load();

            if ptev & PteFlags::VALID.bits() == PteFlags::VALID.bits() {
                // Another CPU resolved the fault first.
                return Ok(FaultResolution::AlreadyValid);
            }

            if Pte::is_locked(ptev) {
                // Another CPU is publishing this entry; wait for it.
                core::hint::spin_loop();
                continue;
            }

            let guard = epoch::pin();
            let Some(area) = self.lookup(va, 1, &guard) else {
                bail!(Fault);
            };
            let node = area.node();
            let npg = area.page_index(va);

            debug!(
                target: "vmm::fault",
                "fault at {va:?} err {error_code:?} mode {:?} pid {}",
                area.mode(), platform::current_pid(),
            );

            if node.page(npg).is_none() && node.alloc_pages().is_err() {
                panic!("page fault: out of memory populating node frames");
            }
            if node.kind() == NodeKind::OnDemand && node.demand_load().is_err() {
                panic!("page fault: loading the backing store failed");
            }

            if area.mode() == AreaMode::Cow
                && error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
            {
                self.pagefault_wcow(area)?;
                mmu.tlb_flush();
                continue;
            }

            if pte.compare_exchange(ptev, ptev | PteFlags::LOCKED.bits()).is_err() {
                continue;
            }

            if area.deleted() {
                // A concurrent removal or replacement won; undo the lock
                // and restart against the current map.
                pte.store(ptev);
                continue;
            }

            let page = node.page(npg).expect("node frame missing after allocation");
            let pa = mmu.v2p(page);
            if area.mode() == AreaMode::Cow {
                pte.store(pa | (PteFlags::PRESENT | PteFlags::USER | PteFlags::COW).bits());
            } else {
                // Private nodes are never shared.
                assert_eq!(Arc::strong_count(node), 1);
                pte.store(pa | PteFlags::VALID.bits());
            }
            return Ok(FaultResolution::Fixed);
        }
    }

    /// Split a copy-on-write area for a write: clone the node and publish
    /// a private area in its place.
    ///
    /// The node is cloned even when this address space holds the only
    /// reference, because a concurrent fork may raise the count at any
    /// instant.
    fn pagefault_wcow(&self, area: &VmArea) -> Result<()> {
        let node = match area.node().copy() {
            Ok(node) => node,
            Err(err) => {
                warn!("copy-on-write split: out of memory");
                return Err(err);
            }
        };
        let replacement = VmArea::new(area.start(), area.end(), AreaMode::Private, node)?;

        if !self.replace_vma(area, Box::new(replacement)) {
            // Lost against a concurrent removal; drop the fresh copy and
            // let the retry observe the tombstone.
            return Ok(());
        }

        update_pages(&self.pml, area.start(), area.end(), |pte| {
            mmu::clear_pte(pte);
        });
        Ok(())
    }

    /// Swap `old` for `new` if `old` is still current. Fails when a
    /// concurrent removal got there first.
    fn replace_vma(&self, old: &VmArea, new: Box<VmArea>) -> bool {
        let span = self.ranges.search_lock(old.start(), old.len());
        if old.deleted() {
            return false;
        }
        let guard = epoch::pin();
        for area in span.iter(&guard) {
            assert!(core::ptr::eq(area, old));
        }
        span.replace(Some(new));
        true
    }

    /// Copy `bytes` into this address space at `va`, writing the backing
    /// frames directly. Useful when this space is not the one installed on
    /// the current CPU.
    ///
    /// # Panics
    ///
    /// Panics when a frame is still missing after allocation; a populated
    /// slot can never become empty again.
    pub fn copy_out(&self, va: VirtAddr, bytes: &[u8]) -> Result<()> {
        let mut va = va;
        let mut bytes = bytes;

        while !bytes.is_empty() {
            let page_start = va.align_down(PAGE_SIZE);
            let guard = epoch::pin();
            let Some(area) = self.lookup(va, 1, &guard) else {
                bail!(BadAddress);
            };

            // A half-filled node is completed here; a full failure shows
            // up as the missing frame below.
            let _ = area.node().alloc_pages();
            let Some(page) = area.node().page(area.page_index(va)) else {
                panic!("copy out: node frame missing after allocation");
            };

            let offset = usize_from(va - page_start);
            let chunk = cmp::min(bytes.len(), usize_from(PAGE_SIZE) - offset);
            unsafe {
                // SAFETY: The node owns the frame; `offset + chunk` stays
                // within the page.
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), page.as_ptr().add(offset), chunk);
            }

            bytes = &bytes[chunk..];
            va = page_start + PAGE_SIZE;
        }

        Ok(())
    }

    /// Whether `va` already has a fully valid, writable user translation.
    ///
    /// Unlike the fast path inside [`Self::page_fault`] this takes no
    /// locks and publishes nothing, so syscall argument validation doesn't
    /// have to go through the fault machinery.
    pub fn probe(&self, va: VirtAddr) -> bool {
        if va.as_u64() >= USER_CEILING {
            return false;
        }
        let Some(pte) = mmu::mmu().walk(&self.pml, va, false) else {
            return false;
        };
        pte.load() & PteFlags::VALID.bits() == PteFlags::VALID.bits()
    }

    /// Clear every entry covering the range, honoring the lock protocol.
    /// Returns whether any entry was previously live.
    fn clear_range(&self, start: VirtAddr, end: VirtAddr) -> bool {
        let mut needs_flush = false;
        update_pages(&self.pml, start, end, |pte| {
            needs_flush |= mmu::clear_pte(pte) != 0;
        });
        needs_flush
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        unsafe {
            // SAFETY: The space is going away; the root is not installed
            // anywhere and the kshared region is unreferenced. Leaf frames
            // are owned by the nodes and survive until their areas are
            // reclaimed.
            slab_allocator().slab_free(Slab::KShared, self.kshared);
            mmu::mmu().free_pml(&self.pml);
        }
    }
}

/// Demote a present, writable user entry to read-only copy-on-write,
/// keeping the frame address. Everything else is left alone.
fn demote_writable(pte: &Pte) {
    loop {
        let value = pte.load();
        if Pte::is_locked(value) {
            core::hint::spin_loop();
            continue;
        }
        if value & PteFlags::VALID.bits() != PteFlags::VALID.bits() {
            break;
        }
        let demoted =
            mmu::pte_addr(value) | (PteFlags::PRESENT | PteFlags::USER | PteFlags::COW).bits();
        if pte.compare_exchange(value, demoted).is_ok() {
            break;
        }
    }
}

/// Resolve a page fault on behalf of the trap handler.
pub fn page_fault(
    space: &AddressSpace,
    va: VirtAddr,
    error_code: PageFaultErrorCode,
) -> Result<FaultResolution> {
    space.page_fault(va, error_code)
}
