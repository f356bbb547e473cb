//! This crate contains constants shared between the virtual-memory subsystem
//! and the rest of the kernel.
#![cfg_attr(not(test), no_std)]

/// The size of one page frame in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// The exclusive upper bound of user virtual addresses. No mapping may reach
/// this address and faults at or above it are rejected.
pub const USER_CEILING: u64 = 0x7fff_ffff_f000;

/// The page-frame capacity of a single backing node. Mappings larger than
/// this can't be backed by one node.
pub const NODE_MAX_PAGES: usize = 128;

/// The size of the per-address-space kernel-shared region in bytes.
pub const KSHARED_SIZE: usize = 0x2000;

/// The maximum number of threads that may concurrently execute inside an
/// epoch critical section. Embedders hand out reader slots below this bound.
pub const MAX_EPOCH_SLOTS: usize = 256;

// The page size must be a power of two.
const _: () = assert!(PAGE_SIZE.is_power_of_two());

// The user ceiling and the kernel-shared region are page granular.
const _: () = assert!(USER_CEILING % PAGE_SIZE == 0);
const _: () = assert!(KSHARED_SIZE % PAGE_SIZE as usize == 0);

// The largest possible node still fits below the user ceiling.
const _: () = assert!(NODE_MAX_PAGES as u64 * PAGE_SIZE <= USER_CEILING);
