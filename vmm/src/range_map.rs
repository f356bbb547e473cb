//! A concurrent, ordered map of non-overlapping areas.
//!
//! Readers never block: they walk an immutable snapshot published through
//! an atomic pointer and protected by the epoch reclaimer. Writers lock
//! the address span they mutate (two writers on overlapping spans
//! serialize, disjoint spans proceed in parallel) and publish by swapping
//! in a rebuilt snapshot. Replaced areas are tombstoned so that readers
//! still holding them can detect the removal, and their destruction is
//! deferred until no epoch critical section can observe them.

use alloc::{boxed::Box, vec::Vec};
use core::{
    ops::Range,
    sync::atomic::{AtomicPtr, Ordering},
};

use spin::Mutex;
use x86_64::VirtAddr;

use crate::{
    area::VmArea,
    epoch::{self, EpochGuard},
};

pub struct RangeMap {
    snapshot: AtomicPtr<Snapshot>,
    spans: Mutex<Vec<Range<u64>>>,
}

/// An immutable, address-ordered view of the map. Replaced wholesale on
/// every mutation.
struct Snapshot {
    areas: Vec<*const VmArea>,
}

// SAFETY: The areas behind the pointers are shared between threads and
// internally synchronized; snapshots themselves are immutable.
unsafe impl Send for Snapshot {}
unsafe impl Sync for Snapshot {}

/// Moves a raw pointer into a deferred destructor.
struct SendPtr<T>(*mut T);

// SAFETY: The reclaimer runs each destructor exactly once, on whatever
// thread happens to collect it; the pointee is not referenced anymore.
unsafe impl<T> Send for SendPtr<T> {}

impl<T> SendPtr<T> {
    // Keeps closures capturing the wrapper, not the raw pointer field.
    fn get(self) -> *mut T {
        self.0
    }
}

impl Snapshot {
    fn find(&self, start: VirtAddr, len: u64) -> Option<&VmArea> {
        let end = start.as_u64().checked_add(len)?;

        // The first area ending above the query's start is the only
        // possible overlap.
        let index = self.areas.partition_point(|&area| {
            // SAFETY: A live snapshot only references live areas.
            let area = unsafe { &*area };
            area.end().as_u64() <= start.as_u64()
        });
        // SAFETY: See above.
        let area = unsafe { &**self.areas.get(index)? };
        (area.start().as_u64() < end).then_some(area)
    }
}

impl RangeMap {
    pub fn new() -> Self {
        let empty = Box::into_raw(Box::new(Snapshot { areas: Vec::new() }));
        Self {
            snapshot: AtomicPtr::new(empty),
            spans: Mutex::new(Vec::new()),
        }
    }

    fn snapshot<'g>(&self, _guard: &'g EpochGuard) -> &'g Snapshot {
        // SAFETY: Snapshots are only freed after every epoch critical
        // section that could observe them has ended; the guard keeps ours
        // open.
        unsafe { &*self.snapshot.load(Ordering::SeqCst) }
    }

    /// Find any area overlapping `[start, start + len)`. The reference
    /// stays valid for the lifetime of the guard.
    pub fn search<'g>(
        &self,
        start: VirtAddr,
        len: u64,
        guard: &'g EpochGuard,
    ) -> Option<&'g VmArea> {
        self.snapshot(guard).find(start, len)
    }

    /// Visit every area in address order. The iteration walks the snapshot
    /// current at the call; concurrent mutations don't show up.
    pub fn iter<'g>(&self, guard: &'g EpochGuard) -> impl Iterator<Item = &'g VmArea> {
        self.snapshot(guard).areas.iter().map(|&area| {
            // SAFETY: The guard keeps the snapshot's areas alive.
            unsafe { &*area }
        })
    }

    /// Lock `[start, start + len)` for mutation. Readers are unaffected;
    /// other lockers of an overlapping span spin until the guard drops.
    pub fn search_lock(&self, start: VirtAddr, len: u64) -> SpanGuard<'_> {
        let start = start.as_u64();
        let range = start..start + len;

        loop {
            let mut spans = self.spans.lock();
            let overlap = spans
                .iter()
                .any(|span| span.start < range.end && range.start < span.end);
            if !overlap {
                spans.push(range.clone());
                break;
            }
            drop(spans);
            core::hint::spin_loop();
        }

        SpanGuard { map: self, range }
    }
}

impl Drop for RangeMap {
    fn drop(&mut self) {
        // The address space owning the map is going away; no reader can
        // hold references anymore.
        let snapshot = unsafe { Box::from_raw(*self.snapshot.get_mut()) };
        for &area in &snapshot.areas {
            unsafe { drop(Box::from_raw(area.cast_mut())) };
        }
    }
}

/// Exclusive write access to one address span of a [`RangeMap`].
pub struct SpanGuard<'a> {
    map: &'a RangeMap,
    range: Range<u64>,
}

impl SpanGuard<'_> {
    /// The areas currently inside the span, in address order.
    ///
    /// Stable while the guard is held: every mutation of the map runs
    /// under an overlapping span lock.
    pub fn iter<'g>(&self, guard: &'g EpochGuard) -> impl Iterator<Item = &'g VmArea> {
        let range = self.range.clone();
        self.map
            .snapshot(guard)
            .areas
            .iter()
            .map(|&area| {
                // SAFETY: The guard keeps the snapshot's areas alive.
                unsafe { &*area }
            })
            .filter(move |area| {
                area.start().as_u64() < range.end && range.start < area.end().as_u64()
            })
    }

    /// Replace every area inside the span with `new` (or with nothing).
    ///
    /// The removed areas are tombstoned before this returns, so work that
    /// follows a replacement (clearing page-table entries, say) is ordered
    /// after the mark. Their destruction is deferred until no reader can
    /// observe them.
    pub fn replace(&self, new: Option<Box<VmArea>>) {
        let new = new.map(|area| Box::into_raw(area).cast_const());
        let guard = epoch::pin();

        loop {
            let current = self.map.snapshot.load(Ordering::SeqCst);
            // SAFETY: Pinned above.
            let snapshot = unsafe { &*current };

            let mut areas = Vec::with_capacity(snapshot.areas.len() + 1);
            let mut removed = Vec::new();
            for &area in &snapshot.areas {
                // SAFETY: A live snapshot only references live areas.
                let r = unsafe { &*area };
                if r.start().as_u64() < self.range.end && self.range.start < r.end().as_u64() {
                    removed.push(area);
                } else {
                    areas.push(area);
                }
            }
            if let Some(new) = new {
                // SAFETY: `new` came out of the box above.
                let start = unsafe { (*new).start() };
                let index = areas.partition_point(|&area| unsafe { (*area).start() } < start);
                areas.insert(index, new);
            }

            let next = Box::into_raw(Box::new(Snapshot { areas }));
            match self
                .map
                .snapshot
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    for &area in &removed {
                        // SAFETY: The area stays allocated until the
                        // deferred destructor runs.
                        unsafe { (*area).mark_deleted() };
                        let area = SendPtr(area.cast_mut());
                        epoch::defer(move || {
                            // SAFETY: Unlinked above; nothing references
                            // the area once the grace period has passed.
                            unsafe { drop(Box::from_raw(area.get())) }
                        });
                    }
                    let retired = SendPtr(current);
                    epoch::defer(move || {
                        // SAFETY: Same as above, for the old snapshot.
                        unsafe { drop(Box::from_raw(retired.get())) }
                    });
                    drop(guard);
                    return;
                }
                Err(_) => {
                    // A writer on a disjoint span won the swap; rebuild
                    // against the fresh snapshot.
                    unsafe { drop(Box::from_raw(next)) };
                }
            }
        }
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        let mut spans = self.map.spans.lock();
        let index = spans
            .iter()
            .position(|span| *span == self.range)
            .expect("span lock registry corrupted");
        spans.swap_remove(index);
    }
}
