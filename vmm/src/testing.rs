//! Host-side stand-ins for the collaborators, so the whole subsystem runs
//! under `cargo test`: a software-walked page table, heap-backed frame and
//! slab allocators and an in-memory backing file.

use alloc::{sync::Arc, vec::Vec};
use core::{
    cmp,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};
use std::alloc::Layout;

use usize_conversions::usize_from;
use x86_64::VirtAddr;

use crate::{
    epoch,
    error::Result,
    mmu::{self, Mmu, Pml, Pte, PteFlags},
    node::FileBacking,
    platform::{
        self, BackingFile, PageAllocator, ProcessContext, Slab, SlabAllocator, page_allocator,
    },
    space::AddressSpace,
};
use constants::{KSHARED_SIZE, MAX_EPOCH_SLOTS, PAGE_SIZE};

/// Register the host platform. Idempotent; every test calls this first.
pub fn setup() {
    platform::init_page_allocator(&HostPageAllocator);
    platform::init_slab_allocator(&HostSlabAllocator);
    platform::init_process_context(&HostProcessContext);
    mmu::init_mmu(&HostMmu);
}

struct HostPageAllocator;

const PAGE_LAYOUT: Layout =
    unsafe { Layout::from_size_align_unchecked(PAGE_SIZE as usize, PAGE_SIZE as usize) };

impl PageAllocator for HostPageAllocator {
    fn alloc_page(&self) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { std::alloc::alloc(PAGE_LAYOUT) })
    }

    unsafe fn free_page(&self, page: NonNull<u8>) {
        unsafe { std::alloc::dealloc(page.as_ptr(), PAGE_LAYOUT) };
    }
}

struct HostSlabAllocator;

const KSHARED_LAYOUT: Layout =
    unsafe { Layout::from_size_align_unchecked(KSHARED_SIZE, PAGE_SIZE as usize) };

impl SlabAllocator for HostSlabAllocator {
    fn slab_alloc(&self, slab: Slab) -> Option<NonNull<u8>> {
        let Slab::KShared = slab;
        NonNull::new(unsafe { std::alloc::alloc_zeroed(KSHARED_LAYOUT) })
    }

    unsafe fn slab_free(&self, slab: Slab, object: NonNull<u8>) {
        let Slab::KShared = slab;
        unsafe { std::alloc::dealloc(object.as_ptr(), KSHARED_LAYOUT) };
    }
}

struct HostProcessContext;

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

impl ProcessContext for HostProcessContext {
    fn current_pid(&self) -> u32 {
        1
    }

    fn epoch_slot(&self) -> usize {
        std::thread_local! {
            static SLOT: usize = NEXT_SLOT.fetch_add(1, Ordering::SeqCst) % MAX_EPOCH_SLOTS;
        }
        SLOT.with(|slot| *slot)
    }
}

/// A software-walked four-level page table with identity `v2p`.
struct HostMmu;

impl HostMmu {
    fn alloc_table() -> Option<NonNull<u8>> {
        let table = page_allocator().alloc_page()?;
        unsafe {
            // SAFETY: Freshly allocated; zero entries mean "not present".
            ptr::write_bytes(table.as_ptr(), 0, usize_from(PAGE_SIZE));
        }
        Some(table)
    }

    /// Resolve the child table behind `entries[index]`, creating it on
    /// demand. Concurrent walks race the installation with a CAS; losers
    /// give their table back.
    fn descend(entries: NonNull<Pte>, index: usize, create: bool) -> Option<NonNull<Pte>> {
        // SAFETY: Every table holds 512 entries.
        let entry = unsafe { &*entries.as_ptr().add(index) };
        loop {
            let value = entry.load();
            if value & PteFlags::PRESENT.bits() != 0 {
                return NonNull::new(mmu::pte_addr(value) as *mut Pte);
            }
            if !create {
                return None;
            }

            let child = Self::alloc_table()?;
            let installed = child.as_ptr() as u64 | PteFlags::VALID.bits();
            if entry.compare_exchange(value, installed).is_ok() {
                return Some(child.cast());
            }
            unsafe {
                // SAFETY: The table lost the race and was never shared.
                page_allocator().free_page(child);
            }
        }
    }

    unsafe fn free_tables(table: NonNull<u8>, level: u8) {
        if level > 1 {
            let entries = table.cast::<Pte>();
            for index in 0..512 {
                // SAFETY: Every table holds 512 entries.
                let value = unsafe { (*entries.as_ptr().add(index)).load() };
                if value & PteFlags::PRESENT.bits() != 0 {
                    let child = mmu::pte_addr(value) as *mut u8;
                    unsafe {
                        // SAFETY: Present intermediate entries point at
                        // tables this Mmu allocated.
                        Self::free_tables(NonNull::new_unchecked(child), level - 1);
                    }
                }
            }
        }
        unsafe {
            // SAFETY: Table pages are exclusively owned by the walker.
            page_allocator().free_page(table);
        }
    }
}

impl Mmu for HostMmu {
    fn new_kernel_pml(&self) -> Option<Pml> {
        Self::alloc_table().map(Pml::new)
    }

    unsafe fn free_pml(&self, pml: &Pml) {
        unsafe { Self::free_tables(pml.root(), 4) };
    }

    fn install_kshared(&self, _pml: &Pml, _region: NonNull<u8>) -> Result<()> {
        Ok(())
    }

    fn walk<'a>(&self, pml: &'a Pml, va: VirtAddr, create: bool) -> Option<&'a Pte> {
        let mut table = pml.root().cast::<Pte>();
        for index in [va.p4_index(), va.p3_index(), va.p2_index()] {
            table = Self::descend(table, usize::from(index), create)?;
        }
        // SAFETY: The leaf table holds 512 entries; the lifetime is bound
        // to the root, which outlives all of its tables.
        Some(unsafe { &*table.as_ptr().add(usize::from(va.p1_index())) })
    }

    fn tlb_flush(&self) {
        // The host walk has no translation cache.
    }

    fn v2p(&self, page: NonNull<u8>) -> u64 {
        page.as_ptr() as u64
    }
}

/// An in-memory backing file.
pub struct ByteFile(Vec<u8>);

impl BackingFile for ByteFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let offset = usize_from(offset);
        if offset >= self.0.len() {
            return Ok(0);
        }
        let n = cmp::min(buf.len(), self.0.len() - offset);
        buf[..n].copy_from_slice(&self.0[offset..offset + n]);
        Ok(n)
    }
}

/// A file backing over the given bytes.
pub fn byte_file(bytes: &[u8], offset: u64, len: u64) -> FileBacking {
    FileBacking {
        file: Arc::new(ByteFile(bytes.to_vec())),
        offset,
        len,
    }
}

/// Read bytes out of an address space the way a faulted-in user mapping
/// would see them: straight from the backing frames, with unpopulated
/// pages reading as zeros. Returns false when the range is unmapped.
pub fn read_user(space: &AddressSpace, va: VirtAddr, buf: &mut [u8]) -> bool {
    let mut va = va;
    let mut done = 0;

    while done < buf.len() {
        let page_start = va.align_down(PAGE_SIZE);
        let guard = epoch::pin();
        let Some(area) = space.lookup(va, 1, &guard) else {
            return false;
        };

        let offset = usize_from(va - page_start);
        let chunk = cmp::min(buf.len() - done, usize_from(PAGE_SIZE) - offset);
        match area.node().page(area.page_index(va)) {
            Some(page) => unsafe {
                // SAFETY: `offset + chunk` stays within the frame.
                ptr::copy_nonoverlapping(
                    page.as_ptr().add(offset),
                    buf[done..].as_mut_ptr(),
                    chunk,
                );
            },
            None => buf[done..done + chunk].fill(0),
        }

        done += chunk;
        va = page_start + PAGE_SIZE;
    }

    true
}
