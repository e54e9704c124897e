//! User-space virtual memory: per-process address spaces, demand paging
//! against shared memory bundles, copy-on-write chains, and fork-style
//! duplication.
//!
//! The crate is purely a state machine over its external contracts: the
//! physical allocator ([`phys::PhysAccess`]), the machine page table
//! ([`pt::PageSpace`]), and the completion work queue
//! ([`work::WorkQueue`]). Nothing here blocks; operations that may
//! suspend take caller-allocated nodes and post their completions.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod accessor;
pub mod aspace;
pub mod bundle;
mod err;
pub mod phys;
pub mod pt;
mod sync;
pub mod types;
pub mod view;
pub mod work;

pub use err::{Error, Result};

#[cfg(test)]
mod testutil;
