//! Contract against the machine page table serving one address space.

use alloc::sync::Arc;

use arrayvec::ArrayVec;

use crate::types::{PhysAddr, Protection, VirtAddr};
use crate::work::{Completion, WorkQueue};

/// Maximum number of single-page invalidations carried by one shootdown
/// request before falling back to a full-range flush.
pub const MAX_SHOOT_PAGES: usize = 8;

/// The set of translations a shootdown must invalidate.
#[derive(Debug, Clone)]
pub enum ShootRequest {
    /// Invalidate only the listed pages.
    Pages(ArrayVec<VirtAddr, MAX_SHOOT_PAGES>),
    /// Invalidate the whole range.
    Range { address: VirtAddr, size: usize },
}

/// A TLB shootdown completion record.
///
/// Posted to the page-table layer; completes once every CPU that may have
/// cached one of the stale translations has acknowledged invalidation.
pub struct ShootNode {
    request: ShootRequest,
    completion: Completion<()>,
}

impl ShootNode {
    pub fn new(request: ShootRequest) -> Arc<Self> {
        Arc::new(Self {
            request,
            completion: Completion::new(),
        })
    }

    pub fn with_callback(
        request: ShootRequest,
        callback: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            request,
            completion: Completion::with_callback(move |()| callback()),
        })
    }

    pub fn request(&self) -> &ShootRequest {
        &self.request
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    /// Marks the shootdown complete on the synchronous path (all CPUs
    /// already consistent when `shootdown` returned `true`).
    pub fn complete_inline(&self) {
        self.completion.complete_inline(());
    }

    /// Marks the shootdown complete and posts the continuation.
    ///
    /// Called by the page-table layer once every CPU has acknowledged.
    pub fn complete(&self, queue: &Arc<dyn WorkQueue>) {
        self.completion.complete(queue, ());
    }
}

/// Machine page table of one address space.
///
/// Implementations synchronize internally; the memory core calls these
/// while holding the owning address space's lock.
///
/// # Safety
///
/// Implementors must ensure that `map` installs exactly the requested
/// translation, that `unmap` returns the previously installed physical
/// address, and that `shootdown`, once complete, guarantees no CPU still
/// holds a stale translation for the requested range.
pub unsafe trait PageSpace: Send + Sync {
    /// Installs (or replaces) the translation for the page at `va`.
    fn map(&self, va: VirtAddr, phys: PhysAddr, prot: Protection);

    /// Changes the protection of an installed translation. Returns false
    /// if `va` is not mapped.
    fn protect(&self, va: VirtAddr, prot: Protection) -> bool;

    /// Removes the translation for the page at `va`, returning the
    /// physical address it pointed to.
    fn unmap(&self, va: VirtAddr) -> Option<PhysAddr>;

    fn is_mapped(&self, va: VirtAddr) -> bool;

    /// Walks the table and translates `va` (any alignment) to the
    /// physical address backing it.
    fn translate(&self, va: VirtAddr) -> Option<PhysAddr>;

    /// Broadcasts invalidation of the requested translations.
    ///
    /// Returns `true` if all CPUs were already consistent and the node
    /// was completed inline; otherwise the node completes later via the
    /// work queue.
    fn shootdown(&self, node: &Arc<ShootNode>) -> bool;

    /// Switches the executing CPU to this page table.
    fn activate(&self);
}
