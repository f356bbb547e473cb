//! Epoch-based reclamation for lock-free readers of the range map.
//!
//! Readers enter a critical section with [`pin`] and may then hold
//! references into the map until the guard drops. Writers unlink objects
//! and hand their destructors to [`defer`]; each runs once the global
//! epoch has advanced far enough that no critical section which could
//! have observed the object is still running.

use alloc::{boxed::Box, vec::Vec};
use core::{
    marker::PhantomData,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use constants::MAX_EPOCH_SLOTS;
use spin::Mutex;

use crate::platform;

/// Marks a reader slot with no running critical section.
const INACTIVE: u64 = u64::MAX;

/// An object deferred at epoch `e` is freed once the global epoch reaches
/// `e + GRACE_EPOCHS`. Two grace epochs make sure that every reader which
/// could have loaded a reference to the object has unpinned.
const GRACE_EPOCHS: u64 = 2;

pub(crate) static RECLAIMER: EpochReclaimer = EpochReclaimer::new();

/// Enter an epoch critical section on the current thread.
///
/// References obtained from the range map stay valid until the returned
/// guard is dropped. Critical sections nest.
pub fn pin() -> EpochGuard {
    RECLAIMER.pin()
}

/// Queue `f` to run once no epoch critical section can observe the object
/// it frees anymore.
pub(crate) fn defer(f: impl FnOnce() + Send + 'static) {
    RECLAIMER.defer(f);
}

pub struct EpochReclaimer {
    global: AtomicU64,
    slots: [ReaderSlot; MAX_EPOCH_SLOTS],
    deferred: Mutex<Vec<Deferred>>,
}

struct ReaderSlot {
    epoch: AtomicU64,
    depth: AtomicU32,
}

impl ReaderSlot {
    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(INACTIVE),
            depth: AtomicU32::new(0),
        }
    }
}

struct Deferred {
    epoch: u64,
    run: Box<dyn FnOnce() + Send>,
}

impl EpochReclaimer {
    const fn new() -> Self {
        Self {
            global: AtomicU64::new(0),
            slots: [const { ReaderSlot::new() }; MAX_EPOCH_SLOTS],
            deferred: Mutex::new(Vec::new()),
        }
    }

    fn pin(&'static self) -> EpochGuard {
        let slot_index = platform::process_context().epoch_slot();
        let slot = &self.slots[slot_index];

        // The depth counter is only ever touched by the thread owning the
        // slot.
        if slot.depth.load(Ordering::Relaxed) == 0 {
            // Publish the epoch this reader entered at, then re-check the
            // global epoch: an advance that scanned the slots before the
            // store landed must not leave this reader behind.
            loop {
                let epoch = self.global.load(Ordering::SeqCst);
                slot.epoch.store(epoch, Ordering::SeqCst);
                if self.global.load(Ordering::SeqCst) == epoch {
                    break;
                }
            }
        }
        slot.depth.fetch_add(1, Ordering::Relaxed);

        EpochGuard {
            slot: slot_index,
            _not_send_sync: PhantomData,
        }
    }

    fn unpin(&self, slot_index: usize) {
        let slot = &self.slots[slot_index];
        if slot.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            slot.epoch.store(INACTIVE, Ordering::SeqCst);
            self.try_collect();
        }
    }

    fn defer(&self, f: impl FnOnce() + Send + 'static) {
        let epoch = self.global.load(Ordering::SeqCst);
        self.deferred.lock().push(Deferred {
            epoch,
            run: Box::new(f),
        });
        self.try_collect();
    }

    /// Advance the global epoch if possible and run every deferred callback
    /// whose grace period has passed.
    fn try_collect(&self) {
        let mut ready = Vec::new();
        {
            let Some(mut deferred) = self.deferred.try_lock() else {
                // Another thread is already collecting.
                return;
            };

            self.try_advance();

            let global = self.global.load(Ordering::SeqCst);
            let mut index = 0;
            while index < deferred.len() {
                if deferred[index].epoch + GRACE_EPOCHS <= global {
                    ready.push(deferred.swap_remove(index));
                } else {
                    index += 1;
                }
            }
        }

        // Run the callbacks outside the lock; they free pages and drop
        // backing files.
        for deferred in ready {
            (deferred.run)();
        }
    }

    fn try_advance(&self) {
        let global = self.global.load(Ordering::SeqCst);
        let straggler = self.slots.iter().any(|slot| {
            let epoch = slot.epoch.load(Ordering::SeqCst);
            epoch != INACTIVE && epoch != global
        });
        if straggler {
            return;
        }

        // A failed exchange means another thread advanced the epoch for us.
        let _ = self
            .global
            .compare_exchange(global, global + 1, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// An open epoch critical section.
pub struct EpochGuard {
    slot: usize,
    // The guard is bound to the thread whose reader slot it pinned.
    _not_send_sync: PhantomData<*const ()>,
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        RECLAIMER.unpin(self.slot);
    }
}
