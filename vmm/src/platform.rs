//! Interfaces to the subsystem's collaborators.
//!
//! The physical page allocator, the slab allocator, the backing-store file
//! abstraction and the current-process accessor are owned by other parts of
//! the kernel. They are registered once at boot and consumed through the
//! accessors below.

use core::ptr::NonNull;

use spin::Once;

use crate::error::Result;

/// The physical page-frame provider.
///
/// Frames are `PAGE_SIZE` bytes large and aligned. Their contents after
/// allocation are unspecified; callers zero them before publication.
pub trait PageAllocator: Sync {
    /// Allocate one page frame. Returns `None` when physical memory is
    /// exhausted.
    fn alloc_page(&self) -> Option<NonNull<u8>>;

    /// Return a frame previously handed out by [`Self::alloc_page`].
    ///
    /// # Safety
    ///
    /// The frame must originate from `alloc_page` on the same allocator and
    /// must not be referenced anymore.
    unsafe fn free_page(&self, page: NonNull<u8>);
}

/// Identifies a slab cache of small kernel objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slab {
    /// The per-address-space kernel-shared region (`KSHARED_SIZE` bytes).
    KShared,
}

/// The slab allocator for small kernel objects.
pub trait SlabAllocator: Sync {
    /// Allocate one object from the given cache.
    fn slab_alloc(&self, slab: Slab) -> Option<NonNull<u8>>;

    /// Return an object to its cache.
    ///
    /// # Safety
    ///
    /// The object must originate from `slab_alloc` with the same `slab` and
    /// must not be referenced anymore.
    unsafe fn slab_free(&self, slab: Slab, object: NonNull<u8>);
}

/// A random-access backing store for on-demand mappings.
///
/// Handle duplication and release (`file_dup`/`file_put` in the kernel's C
/// parlance) map onto cloning and dropping the `Arc` holding the trait
/// object.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset` into `buf` and return the
    /// number of bytes read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
}

/// Access to the thread currently executing on this CPU.
pub trait ProcessContext: Sync {
    /// The process id of the current thread, for diagnostics.
    fn current_pid(&self) -> u32;

    /// A stable index identifying the current thread among all concurrently
    /// running threads, used to track epoch readers.
    ///
    /// The index must stay fixed while the thread is inside an epoch
    /// critical section, must never be shared by two threads that run
    /// concurrently, and must be below `MAX_EPOCH_SLOTS`.
    fn epoch_slot(&self) -> usize;
}

static PAGE_ALLOCATOR: Once<&'static dyn PageAllocator> = Once::new();
static SLAB_ALLOCATOR: Once<&'static dyn SlabAllocator> = Once::new();
static PROCESS_CONTEXT: Once<&'static dyn ProcessContext> = Once::new();

pub fn init_page_allocator(allocator: &'static dyn PageAllocator) {
    PAGE_ALLOCATOR.call_once(|| allocator);
}

pub fn init_slab_allocator(allocator: &'static dyn SlabAllocator) {
    SLAB_ALLOCATOR.call_once(|| allocator);
}

pub fn init_process_context(context: &'static dyn ProcessContext) {
    PROCESS_CONTEXT.call_once(|| context);
}

pub(crate) fn page_allocator() -> &'static dyn PageAllocator {
    *PAGE_ALLOCATOR.get().expect("no page allocator registered")
}

pub(crate) fn slab_allocator() -> &'static dyn SlabAllocator {
    *SLAB_ALLOCATOR.get().expect("no slab allocator registered")
}

pub(crate) fn process_context() -> &'static dyn ProcessContext {
    *PROCESS_CONTEXT.get().expect("no process context registered")
}

/// The pid of the current thread, or zero very early during boot.
pub(crate) fn current_pid() -> u32 {
    PROCESS_CONTEXT
        .get()
        .map(|context| context.current_pid())
        .unwrap_or(0)
}
