//! Contracts against the external physical memory allocator.

use alloc::sync::Arc;

use crate::err::Result;
use crate::types::{PhysAddr, PAGE_SIZE};
use crate::work::WorkQueue;

/// The external physical page allocator, plus the direct-map translation
/// used to reach page contents.
///
/// # Safety
///
/// Implementors must hand out exclusively-owned, page-aligned physical
/// ranges, and `phys_to_virt` must return a pointer through which the
/// entire owned range starting at `addr` can be read and written for as
/// long as the range has not been freed.
pub unsafe trait PhysAccess: Send + Sync {
    /// Allocates one page.
    fn alloc_page(&self) -> Result<PhysAddr>;

    /// Allocates `size` physically contiguous bytes aligned to `align`.
    fn alloc_contiguous(&self, size: usize, align: usize) -> Result<PhysAddr>;

    /// Returns a previously allocated range to the allocator.
    ///
    /// # Safety
    ///
    /// `addr`/`size` must denote exactly one prior allocation, and no
    /// live pointer derived from `phys_to_virt` may be used afterwards.
    unsafe fn free(&self, addr: PhysAddr, size: usize);

    /// Translates a physical address to a virtual pointer through the
    /// direct map.
    fn phys_to_virt(&self, addr: PhysAddr) -> *mut u8;
}

/// Process-wide services consumed by the memory core, passed explicitly
/// into constructors.
pub struct VmContext {
    phys: Arc<dyn PhysAccess>,
    work: Arc<dyn WorkQueue>,
}

impl VmContext {
    pub fn new(phys: Arc<dyn PhysAccess>, work: Arc<dyn WorkQueue>) -> Arc<Self> {
        Arc::new(Self { phys, work })
    }

    pub fn phys(&self) -> &Arc<dyn PhysAccess> {
        &self.phys
    }

    pub fn work(&self) -> &Arc<dyn WorkQueue> {
        &self.work
    }

    /// Zero-fills an owned physical range.
    ///
    /// # Safety
    ///
    /// The caller must own `[addr, addr + size)` and no other thread may
    /// access it concurrently.
    pub(crate) unsafe fn zero_range(&self, addr: PhysAddr, size: usize) {
        let ptr = self.phys.phys_to_virt(addr);
        // Safety: per the function contract, the range is owned and
        // unaliased.
        unsafe {
            core::ptr::write_bytes(ptr, 0, size);
        }
    }

    /// Copies one page of physical memory from `src` to `dst`.
    ///
    /// # Safety
    ///
    /// The caller must own the destination page, and the source page must
    /// remain valid (not freed) for the duration of the copy.
    pub(crate) unsafe fn copy_page(&self, dst: PhysAddr, src: PhysAddr) {
        let src_ptr = self.phys.phys_to_virt(src);
        let dst_ptr = self.phys.phys_to_virt(dst);
        // Safety: distinct physical pages never overlap; validity is the
        // caller's obligation.
        unsafe {
            core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, PAGE_SIZE);
        }
    }
}
