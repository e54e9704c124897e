use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::bundle::{FetchNode, MemoryBundle};
use crate::err::{Error, Result};
use crate::phys::VmContext;
use crate::sync::SpinLock;
use crate::types::{PhysAddr, PhysRange, PAGE_SIZE};
use crate::view::VirtualView;

/// What a [`CowBundle`] overlays: either a root view or another layer.
///
/// Parent links are strong; nothing points from a parent to its children,
/// so chains cannot form cycles.
pub enum CowParent {
    View(Arc<dyn VirtualView>),
    Chain(Arc<CowBundle>),
}

impl CowParent {
    fn length(&self) -> usize {
        match self {
            CowParent::View(view) => view.length(),
            CowParent::Chain(chain) => chain.length(),
        }
    }
}

enum CowPage {
    /// A locally-owned copy, immutable in identity until the bundle dies.
    Copied(PhysAddr),
    /// A parent fetch is in flight; these nodes complete when the copy is
    /// published. Each entry carries the waiter's in-page offset.
    InFlight(Vec<(usize, Arc<FetchNode>)>),
}

/// One layer of a copy-on-write chain.
///
/// The first fetch of a page copies it out of the parent into a freshly
/// allocated page owned by this layer; every later fetch (and peek)
/// observes that same copy. Concurrent fetches for one page coalesce so
/// exactly one copy is ever allocated per page per layer.
pub struct CowBundle {
    ctx: Arc<VmContext>,
    parent: CowParent,
    window_offset: usize,
    length: usize,
    state: SpinLock<BTreeMap<usize, CowPage>>,
}

impl CowBundle {
    /// Creates a layer covering `length` bytes of `parent` starting at
    /// `window_offset`.
    ///
    /// # Errors
    ///
    /// * `BadAddress` - the window does not fit within the parent, or
    ///   `window_offset`/`length` are not page-aligned.
    pub fn new(
        ctx: Arc<VmContext>,
        parent: CowParent,
        window_offset: usize,
        length: usize,
    ) -> Result<Arc<Self>> {
        let parent_len = parent.length();
        if !num_utils::is_aligned(window_offset, PAGE_SIZE)
            || !num_utils::is_aligned(length, PAGE_SIZE)
            || length == 0
            || window_offset > parent_len
            || length > parent_len - window_offset
        {
            return Err(Error::BadAddress);
        }

        Ok(Arc::new(Self {
            ctx,
            parent,
            window_offset,
            length,
            state: SpinLock::new(BTreeMap::new()),
        }))
    }

    /// Creates a child layer covering this layer's whole window.
    pub fn make_child(self: &Arc<Self>) -> Arc<CowBundle> {
        let length = self.length;
        Arc::new(CowBundle {
            ctx: Arc::clone(&self.ctx),
            parent: CowParent::Chain(Arc::clone(self)),
            window_offset: 0,
            length,
            state: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Issues the parent fetch for `page`, returning `true` if the copy
    /// was produced synchronously.
    fn start_copy(self: &Arc<Self>, page: usize, node: &Arc<FetchNode>) -> bool {
        let parent_offset = self.window_offset + page * PAGE_SIZE;

        let this = Arc::clone(self);
        let parent_node = FetchNode::with_callback(move |result| {
            this.finish_copy(page, result, None);
        });

        let sync = match &self.parent {
            CowParent::View(view) => match view.resolve_range(parent_offset, PAGE_SIZE) {
                Ok((bundle, bundle_offset, _)) => bundle.fetch(bundle_offset, &parent_node),
                Err(err) => {
                    self.finish_copy(page, Err(err), Some(node));
                    return true;
                }
            },
            CowParent::Chain(parent) => Arc::clone(parent).fetch(parent_offset, &parent_node),
        };

        if sync {
            let result = parent_node
                .result()
                .expect("synchronous fetch completed without result");
            self.finish_copy(page, result, Some(node));
        }
        sync
    }

    /// Publishes the copy for `page` (or the error) and completes every
    /// coalesced waiter.
    ///
    /// `inline_node`, when present, is completed inline rather than
    /// posted: its submitter is still on the synchronous path.
    fn finish_copy(
        &self,
        page: usize,
        parent_result: Result<PhysRange>,
        inline_node: Option<&Arc<FetchNode>>,
    ) {
        let result = parent_result.and_then(|parent_range| {
            debug_assert!(parent_range.size >= PAGE_SIZE);

            let copy = self.ctx.phys().alloc_page()?;
            // Safety: `copy` was just allocated and is unpublished; the
            // parent page stays alive through the parent reference.
            unsafe {
                self.ctx.copy_page(copy, parent_range.addr);
            }
            Ok(copy)
        });

        let waiters = self.state.with(|pages| {
            let entry = match result {
                // Publish the copy; later fetches observe it directly.
                Ok(copy) => pages.insert(page, CowPage::Copied(copy)),
                // Drop the in-flight marker so a later fetch may retry.
                Err(_) => pages.remove(&page),
            };

            match entry {
                Some(CowPage::InFlight(waiters)) => waiters,
                _ => panic!("copy completed for a page that was not in flight"),
            }
        });

        for (in_page, waiter) in waiters {
            let waiter_result =
                result.map(|copy| PhysRange::new(copy + in_page, PAGE_SIZE - in_page));
            match inline_node {
                Some(inline) if Arc::ptr_eq(inline, &waiter) => {
                    waiter.complete_inline(waiter_result)
                }
                _ => waiter.complete(self.ctx.work(), waiter_result),
            }
        }
    }
}

enum FetchPath {
    Ready(PhysAddr),
    Coalesced,
    Copy,
}

impl MemoryBundle for CowBundle {
    fn length(&self) -> usize {
        self.length
    }

    fn peek(&self, offset: usize) -> Option<PhysAddr> {
        if offset >= self.length {
            return None;
        }

        self.state.with(|pages| {
            match pages.get(&(offset / PAGE_SIZE)) {
                Some(CowPage::Copied(copy)) => Some(*copy + offset % PAGE_SIZE),
                // Never peeks the parent: only a fetch yields memory that
                // is stable against later copies.
                _ => None,
            }
        })
    }

    fn fetch(self: Arc<Self>, offset: usize, node: &Arc<FetchNode>) -> bool {
        if offset >= self.length {
            node.complete_inline(Err(Error::BadAddress));
            return true;
        }

        let page = offset / PAGE_SIZE;
        let in_page = offset % PAGE_SIZE;

        let path = self.state.with(|pages| match pages.get_mut(&page) {
            Some(CowPage::Copied(copy)) => FetchPath::Ready(*copy),
            Some(CowPage::InFlight(waiters)) => {
                waiters.push((in_page, Arc::clone(node)));
                FetchPath::Coalesced
            }
            None => {
                pages.insert(page, CowPage::InFlight(alloc::vec![(in_page, Arc::clone(node))]));
                FetchPath::Copy
            }
        });

        match path {
            FetchPath::Ready(copy) => {
                node.complete_inline(Ok(PhysRange::new(copy + in_page, PAGE_SIZE - in_page)));
                true
            }
            FetchPath::Coalesced => false,
            FetchPath::Copy => self.start_copy(page, node),
        }
    }
}

impl Drop for CowBundle {
    fn drop(&mut self) {
        for page in self.state.get_mut().values() {
            if let CowPage::Copied(copy) = page {
                // Safety: the copy is owned by this layer and no waiter
                // can be alive once the bundle's refcount reaches zero.
                unsafe {
                    self.ctx.phys().free(*copy, PAGE_SIZE);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bundle::AllocatedMemory;
    use crate::phys::PhysAccess;
    use crate::testutil::{test_ctx, GatedBundle};
    use crate::view::ExteriorBundleView;

    /// Fetches `offset` from an `AllocatedMemory` and plants `byte` at
    /// that offset.
    fn plant_byte(
        ctx: &Arc<VmContext>,
        mem: &Arc<AllocatedMemory>,
        offset: usize,
        byte: u8,
    ) -> PhysAddr {
        let node = FetchNode::new();
        assert!(Arc::clone(mem).fetch(offset, &node));
        let addr = node.result().unwrap().unwrap().addr;
        unsafe {
            *ctx.phys().phys_to_virt(addr) = byte;
        }
        addr
    }

    #[test]
    fn first_fetch_copies_parent() {
        let (ctx, phys, _) = test_ctx();
        let mem = AllocatedMemory::new_paged(ctx.clone(), 0x2000);
        let parent_phys = plant_byte(&ctx, &mem, 0x10, 0xaa);

        let view = ExteriorBundleView::of_bundle(mem);
        let cow = CowBundle::new(ctx.clone(), CowParent::View(view), 0, 0x2000).unwrap();

        assert_eq!(cow.peek(0x10), None);

        let node = FetchNode::new();
        assert!(Arc::clone(&cow).fetch(0x10, &node));
        let range = node.result().unwrap().unwrap();

        // The copy is a distinct page with the parent's contents.
        assert_ne!(range.addr, parent_phys);
        assert_eq!(unsafe { *phys.phys_to_virt(range.addr) }, 0xaa);

        // A subsequent peek observes the same physical page.
        assert_eq!(cow.peek(0x10), Some(range.addr));

        // Writing the copy leaves the parent untouched.
        unsafe {
            *ctx.phys().phys_to_virt(range.addr) = 0xbb;
        }
        assert_eq!(unsafe { *phys.phys_to_virt(parent_phys) }, 0xaa);
    }

    #[test]
    fn chained_layers_copy_from_parent_layer() {
        let (ctx, phys, _) = test_ctx();
        let mem = AllocatedMemory::new_paged(ctx.clone(), 0x1000);
        plant_byte(&ctx, &mem, 0, 0x11);

        let view = ExteriorBundleView::of_bundle(mem);
        let base = CowBundle::new(ctx.clone(), CowParent::View(view), 0, 0x1000).unwrap();
        let child = base.make_child();

        let node = FetchNode::new();
        assert!(Arc::clone(&child).fetch(0, &node));
        let child_copy = node.result().unwrap().unwrap().addr;
        assert_eq!(unsafe { *phys.phys_to_virt(child_copy) }, 0x11);

        // The fetch materialized the base layer's copy as well; the two
        // layers own distinct pages.
        let base_copy = base.peek(0).unwrap();
        assert_ne!(base_copy, child_copy);

        // A write through the child stays out of the base layer.
        unsafe {
            *ctx.phys().phys_to_virt(child_copy) = 0x22;
        }
        assert_eq!(unsafe { *phys.phys_to_virt(base_copy) }, 0x11);
    }

    #[test]
    fn concurrent_fetches_coalesce() {
        let (ctx, phys, queue) = test_ctx();
        let gated = GatedBundle::new(ctx.clone(), 0x1000);

        let cow = CowBundle::new(
            ctx.clone(),
            CowParent::View(ExteriorBundleView::of_bundle(gated.clone())),
            0,
            0x1000,
        )
        .unwrap();

        let first = FetchNode::new();
        let second = FetchNode::new();
        assert!(!Arc::clone(&cow).fetch(0x10, &first));
        assert!(!Arc::clone(&cow).fetch(0x20, &second));

        let pages_before = phys.outstanding();
        gated.release();
        queue.drain();

        // Exactly one copy was allocated for the page, and both waiters
        // observed it.
        assert_eq!(phys.outstanding(), pages_before + 2); // gated page + one copy
        let first_range = first.result().unwrap().unwrap();
        let second_range = second.result().unwrap().unwrap();
        assert_eq!(first_range.addr.as_usize() - 0x10, second_range.addr.as_usize() - 0x20);
    }

    #[test]
    fn out_of_range_fetch() {
        let (ctx, _, _) = test_ctx();
        let mem = AllocatedMemory::new_paged(ctx.clone(), 0x1000);
        let view = ExteriorBundleView::of_bundle(mem);
        let cow = CowBundle::new(ctx, CowParent::View(view), 0, 0x1000).unwrap();

        let node = FetchNode::new();
        assert!(Arc::clone(&cow).fetch(0x1000, &node));
        assert_eq!(node.result().unwrap(), Err(Error::BadAddress));
    }

    #[test]
    fn drop_releases_copies() {
        let (ctx, phys, _) = test_ctx();
        let mem = AllocatedMemory::new_paged(ctx.clone(), 0x1000);
        plant_byte(&ctx, &mem, 0, 0x33);

        let view = ExteriorBundleView::of_bundle(mem.clone());
        let cow = CowBundle::new(ctx, CowParent::View(view), 0, 0x1000).unwrap();

        let node = FetchNode::new();
        assert!(Arc::clone(&cow).fetch(0, &node));
        assert_eq!(phys.outstanding(), 2); // parent page + copy

        drop(cow);
        assert_eq!(phys.outstanding(), 1);
    }
}
