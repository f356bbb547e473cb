//! The hardware seam: page-table entries, the entry mutation protocol and
//! the MMU primitives consumed from the architecture layer.
//!
//! Every page-table entry is shared with the MMU, which reads entries at
//! any time without coordination. Software mutators follow one protocol:
//! load the entry, spin while the lock bit is set, then perform the state
//! transition with a single compare-exchange against the observed value.
//! The lock bit grants its holder a short window in which it may rewrite
//! the entry with a plain store.

use core::{ptr::NonNull, sync::atomic::{AtomicU64, Ordering}};

use bit_field::BitField;
use bitflags::bitflags;
use constants::{PAGE_SIZE, USER_CEILING};
use spin::Once;
use x86_64::VirtAddr;

use crate::error::{Result, ensure, err};

const PRESENT_BIT: usize = 0;
const WRITE_BIT: usize = 1;
const USER_BIT: usize = 2;

/// Software bit: one thread is publishing a change to this entry. The MMU
/// ignores this bit; it is a cooperative convention between kernel threads.
const LOCK_BIT: usize = 9;

/// Software bit: the page is shared copy-on-write; a write to it must
/// first split the mapping.
const COW_BIT: usize = 10;

/// The bits of an entry holding the physical frame address.
pub const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    /// Architectural and software bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << PRESENT_BIT;
        const WRITABLE = 1 << WRITE_BIT;
        const USER = 1 << USER_BIT;
        const LOCKED = 1 << LOCK_BIT;
        const COW = 1 << COW_BIT;
    }
}

impl PteFlags {
    /// The bits of a fully resolved, writable user mapping.
    pub const VALID: Self = Self::PRESENT.union(Self::USER).union(Self::WRITABLE);
}

/// The physical frame address stored in an entry.
pub fn pte_addr(entry: u64) -> u64 {
    entry & PHYS_ADDR_MASK
}

/// A page-table entry shared between the MMU and software.
#[repr(transparent)]
pub struct Pte(AtomicU64);

impl Pte {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Perform one state transition against the observed value.
    pub fn compare_exchange(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.0
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    /// Rewrite the entry with a plain store. Only the holder of the lock
    /// bit may do this.
    pub fn store(&self, value: u64) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn is_locked(value: u64) -> bool {
        value.get_bit(LOCK_BIT)
    }
}

impl Default for Pte {
    fn default() -> Self {
        Self::new()
    }
}

/// An owning handle to a hardware page-table root.
///
/// The architecture layer decides the representation behind the pointer;
/// this subsystem only threads the handle through [`Mmu`] calls.
pub struct Pml(NonNull<u8>);

impl Pml {
    pub fn new(root: NonNull<u8>) -> Self {
        Self(root)
    }

    pub fn root(&self) -> NonNull<u8> {
        self.0
    }
}

// SAFETY: The root is only dereferenced by the `Mmu` implementation, which
// synchronizes all entry accesses through atomics.
unsafe impl Send for Pml {}
unsafe impl Sync for Pml {}

/// The hardware-specific MMU primitives.
pub trait Mmu: Sync {
    /// Allocate a page-table root pre-populated with the shared kernel
    /// mappings. Returns `None` when memory is exhausted.
    fn new_kernel_pml(&self) -> Option<Pml>;

    /// Release a root and every intermediate table page reachable from it.
    /// Mapped leaf frames are owned by their nodes and stay untouched.
    ///
    /// # Safety
    ///
    /// No thread may use `pml` afterwards and the root must not be
    /// installed on any CPU.
    unsafe fn free_pml(&self, pml: &Pml);

    /// Map the per-address-space kernel-shared region into `pml`.
    fn install_kshared(&self, pml: &Pml, region: NonNull<u8>) -> Result<()>;

    /// Resolve the entry covering `va`, materialising intermediate tables
    /// when `create` is set. Returns `None` when the entry does not exist
    /// (or, with `create`, when a table page could not be allocated).
    fn walk<'a>(&self, pml: &'a Pml, va: VirtAddr, create: bool) -> Option<&'a Pte>;

    /// Force the MMU to re-walk the page table for subsequent accesses.
    fn tlb_flush(&self);

    /// The physical address of a kernel page pointer.
    fn v2p(&self, page: NonNull<u8>) -> u64;
}

static MMU: Once<&'static dyn Mmu> = Once::new();

pub fn init_mmu(mmu: &'static dyn Mmu) {
    MMU.call_once(|| mmu);
}

pub(crate) fn mmu() -> &'static dyn Mmu {
    *MMU.get().expect("no mmu registered")
}

/// Apply `transform` to every entry covering `[start, end)`, materialising
/// intermediate tables as needed.
///
/// # Panics
///
/// Panics when a table page can't be allocated; the callers operate on
/// ranges that must be walkable.
pub fn update_pages(pml: &Pml, start: VirtAddr, end: VirtAddr, mut transform: impl FnMut(&Pte)) {
    let mmu = mmu();
    let mut va = start.align_down(PAGE_SIZE);
    while va < end {
        let Some(pte) = mmu.walk(pml, va, true) else {
            panic!("out of memory walking the page table for {va:?}");
        };
        transform(pte);
        va += PAGE_SIZE;
    }
}

/// CAS an entry to zero, honoring the lock protocol. Returns the previous
/// value so callers can decide whether a TLB flush is due.
pub(crate) fn clear_pte(pte: &Pte) -> u64 {
    loop {
        let value = pte.load();
        if Pte::is_locked(value) {
            core::hint::spin_loop();
            continue;
        }
        if pte.compare_exchange(value, 0).is_ok() {
            return value;
        }
    }
}

/// Check that `[start, start + len)` doesn't wrap and stays below the user
/// ceiling.
pub(crate) fn check_user_range(start: VirtAddr, len: u64) -> Result<()> {
    let end = start.as_u64().checked_add(len).ok_or(err!(BadAddress))?;
    ensure!(end <= USER_CEILING, BadAddress);
    Ok(())
}
