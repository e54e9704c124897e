//! Bulk access to another address space without mapping it locally.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;

use crate::aspace::{AddressSpace, FaultNode};
use crate::err::{Error, Result};
use crate::types::{AccessType, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::work::Completion;

/// Completion record of one accessor acquisition.
pub struct AcquireNode {
    completion: Completion<Result<()>>,
}

impl AcquireNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            completion: Completion::new(),
        })
    }

    pub fn with_callback(callback: impl FnOnce(Result<()>) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            completion: Completion::with_callback(callback),
        })
    }

    pub fn result(&self) -> Option<Result<()>> {
        self.completion.result()
    }
}

/// Accesses `[address, address + length)` of a foreign address space.
///
/// The accessor keeps the target space alive: teardown of the target is
/// blocked until every accessor is released. [`acquire`] drives a fault
/// over each covered page (ensuring backing exists and a translation is
/// installed); afterwards [`load`], [`write`], and [`get_physical`] are
/// non-blocking page-table walks.
///
/// [`acquire`]: ForeignSpaceAccessor::acquire
/// [`load`]: ForeignSpaceAccessor::load
/// [`write`]: ForeignSpaceAccessor::write
/// [`get_physical`]: ForeignSpaceAccessor::get_physical
pub struct ForeignSpaceAccessor {
    space: Arc<AddressSpace>,
    address: VirtAddr,
    length: usize,
}

impl ForeignSpaceAccessor {
    pub fn new(space: Arc<AddressSpace>, address: VirtAddr, length: usize) -> Arc<Self> {
        Arc::new(Self {
            space,
            address,
            length,
        })
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn address(&self) -> VirtAddr {
        self.address
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Faults in every page of the window with access kind `access`,
    /// chaining page by page; the first failure short-circuits and
    /// completes `node` with it.
    pub fn acquire(self: &Arc<Self>, access: AccessType, node: &Arc<AcquireNode>) -> bool {
        let first = self.address.align_down_page();
        let end = self.address + self.length;
        let page_count = (end.align_up_page() - first) / PAGE_SIZE;

        let progress = Arc::new(AcquireProgress {
            accessor: Arc::clone(self),
            access,
            first,
            page_count,
            next: AtomicUsize::new(0),
            node: Arc::clone(node),
        });

        AcquireProgress::advance(progress, true)
    }

    /// Translates `offset` within the window to a physical address.
    pub fn get_physical(&self, offset: usize) -> Result<PhysAddr> {
        if offset >= self.length {
            return Err(Error::BadAddress);
        }
        self.space
            .ops()
            .translate(self.address + offset)
            .ok_or(Error::BadAddress)
    }

    /// Copies `bytes` into the acquired window at `offset`, crossing page
    /// boundaries via per-page translation.
    ///
    /// # Errors
    ///
    /// * `BufferTooSmall` - the copy does not fit in the window.
    /// * `BadAddress` - a covered page has no installed translation.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.copy(offset, bytes.len(), |phys_ptr, progress, chunk| {
            // Safety: `phys_ptr` points into a live physical page of
            // which `chunk` bytes remain; the ranges cannot overlap.
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr().add(progress), phys_ptr, chunk);
            }
        })
    }

    /// Copies from the acquired window at `offset` into `out`.
    ///
    /// # Errors
    ///
    /// * `BufferTooSmall` - the copy does not fit in the window.
    /// * `BadAddress` - a covered page has no installed translation.
    pub fn load(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let out_ptr = out.as_mut_ptr();
        self.copy(offset, out.len(), |phys_ptr, progress, chunk| {
            // Safety: as in `write`, with the copy direction reversed.
            unsafe {
                core::ptr::copy_nonoverlapping(phys_ptr, out_ptr.add(progress), chunk);
            }
        })
    }

    /// Walks the window page by page, handing `f` the physical pointer
    /// for each piece.
    fn copy(
        &self,
        offset: usize,
        size: usize,
        mut f: impl FnMut(*mut u8, usize, usize),
    ) -> Result<()> {
        if offset > self.length || size > self.length - offset {
            return Err(Error::BufferTooSmall);
        }

        let mut progress = 0;
        while progress < size {
            let va = self.address + offset + progress;
            let chunk = (PAGE_SIZE - va.page_offset()).min(size - progress);
            let phys = self.space.ops().translate(va).ok_or(Error::BadAddress)?;
            let ptr = self.space.ctx().phys().phys_to_virt(phys);
            f(ptr, progress, chunk);
            progress += chunk;
        }

        Ok(())
    }
}

/// Per-acquisition chain state: one fault in flight at a time.
struct AcquireProgress {
    accessor: Arc<ForeignSpaceAccessor>,
    access: AccessType,
    first: VirtAddr,
    page_count: usize,
    next: AtomicUsize,
    node: Arc<AcquireNode>,
}

impl AcquireProgress {
    /// Drives faults until one goes asynchronous or the window is done.
    /// `inline` is true while the original `acquire` call is still on
    /// the stack.
    fn advance(this: Arc<Self>, inline: bool) -> bool {
        loop {
            let index = this.next.load(Ordering::Relaxed);
            if index == this.page_count {
                this.complete(Ok(()), inline);
                return true;
            }
            this.next.store(index + 1, Ordering::Relaxed);

            let va = this.first + index * PAGE_SIZE;
            let chain = Arc::clone(&this);
            let fault = FaultNode::with_callback(move |result| match result {
                Ok(()) => {
                    AcquireProgress::advance(chain, false);
                }
                Err(err) => chain.complete(Err(err), false),
            });

            if !this.accessor.space.handle_fault(va, this.access, &fault) {
                return false;
            }

            match fault.result().expect("synchronous fault without result") {
                Ok(()) => continue,
                Err(err) => {
                    this.complete(Err(err), inline);
                    return true;
                }
            }
        }
    }

    fn complete(&self, result: Result<()>, inline: bool) {
        if inline {
            self.node.completion.complete_inline(result);
        } else {
            self.node
                .completion
                .complete(self.accessor.space.ctx().work(), result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::aspace::{MapBase, MapFlags};
    use crate::bundle::AllocatedMemory;
    use crate::testutil::test_space;
    use crate::types::Protection;
    use crate::view::ExteriorBundleView;

    #[test]
    fn acquire_then_round_trip() {
        let (ctx, _phys, _queue, space) = test_space(0x10000, 0x40000);
        let mem = AllocatedMemory::new_paged(ctx, 0x3000);
        let view = ExteriorBundleView::of_bundle(mem);

        let base = space
            .map(
                view,
                MapBase::PreferBottom,
                0,
                0x3000,
                Protection::READ | Protection::WRITE,
                MapFlags::empty(),
            )
            .unwrap();

        // A window deliberately crossing two page boundaries.
        let accessor =
            ForeignSpaceAccessor::new(space.clone(), base + 0xf00, 0x2200);

        let node = AcquireNode::new();
        assert!(accessor.acquire(AccessType::Write, &node));
        assert_eq!(node.result(), Some(Ok(())));

        let pattern: Vec<u8> = (0..0x2200).map(|i| (i % 251) as u8).collect();
        accessor.write(0, &pattern).unwrap();

        let mut readback = vec![0u8; 0x2200];
        accessor.load(0, &mut readback).unwrap();
        assert_eq!(readback, pattern);

        // The physical translation exists for the whole window.
        assert!(accessor.get_physical(0).is_ok());
        assert!(accessor.get_physical(0x21ff).is_ok());
        assert_eq!(accessor.get_physical(0x2200), Err(Error::BadAddress));
    }

    #[test]
    fn window_overflow_is_rejected() {
        let (ctx, _phys, _queue, space) = test_space(0x10000, 0x40000);
        let mem = AllocatedMemory::new_paged(ctx, 0x1000);
        let view = ExteriorBundleView::of_bundle(mem);
        let base = space
            .map(
                view,
                MapBase::PreferBottom,
                0,
                0x1000,
                Protection::READ | Protection::WRITE,
                MapFlags::empty(),
            )
            .unwrap();

        let accessor = ForeignSpaceAccessor::new(space.clone(), base, 0x800);
        let node = AcquireNode::new();
        assert!(accessor.acquire(AccessType::Write, &node));

        assert_eq!(
            accessor.write(0x700, &[0u8; 0x200]),
            Err(Error::BufferTooSmall)
        );
        let mut buf = [0u8; 0x100];
        assert_eq!(accessor.load(0x800, &mut buf), Err(Error::BufferTooSmall));
    }

    #[test]
    fn unacquired_pages_fail_with_bad_address() {
        let (ctx, _phys, _queue, space) = test_space(0x10000, 0x40000);
        let mem = AllocatedMemory::new_paged(ctx, 0x2000);
        let view = ExteriorBundleView::of_bundle(mem);
        let base = space
            .map(
                view,
                MapBase::PreferBottom,
                0,
                0x2000,
                Protection::READ | Protection::WRITE,
                MapFlags::empty(),
            )
            .unwrap();

        // No acquire: nothing is translated yet.
        let accessor = ForeignSpaceAccessor::new(space.clone(), base, 0x2000);
        assert_eq!(accessor.write(0, &[1, 2, 3]), Err(Error::BadAddress));
    }

    #[test]
    fn acquire_fails_on_unmapped_range() {
        let (_ctx, _phys, _queue, space) = test_space(0x10000, 0x40000);

        let accessor =
            ForeignSpaceAccessor::new(space.clone(), VirtAddr::new(0x10000), 0x1000);
        let node = AcquireNode::new();
        assert!(accessor.acquire(AccessType::Read, &node));
        assert_eq!(node.result(), Some(Err(Error::BadAddress)));
    }
}
