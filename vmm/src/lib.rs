//! The per-process virtual-memory subsystem.
//!
//! Each address space binds three pieces of mutable state together: a
//! concurrent range map of mapped areas, the hardware page table and the
//! reference-counted nodes backing the mapped frames. Faults, forks, maps
//! and unmaps run concurrently on multiple CPUs without an
//! address-space-wide lock; the pieces coordinate through a per-entry lock
//! bit, compare-and-swap publication and epoch-based reclamation.
//!
//! The physical allocators, the backing-store files and the MMU primitives
//! are collaborators registered at boot; see [`platform`] and [`mmu`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod area;
pub mod epoch;
pub mod error;
pub mod mmu;
pub mod node;
pub mod platform;
pub mod range_map;
pub mod space;
#[cfg(test)]
mod testing;

pub use crate::{
    area::{AreaMode, VmArea},
    node::{FileBacking, NodeKind, VmNode},
    space::{AddressSpace, FaultResolution, page_fault},
};
