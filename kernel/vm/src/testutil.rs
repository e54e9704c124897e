//! Test doubles for the external collaborators: a host-allocation-backed
//! physical allocator, a map-based page table, a drainable work queue,
//! and a gated bundle for exercising asynchronous fetch paths.

use std::alloc::Layout;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::aspace::AddressSpace;
use crate::bundle::{FetchNode, MemoryBundle};
use crate::err::{Error, Result};
use crate::phys::{PhysAccess, VmContext};
use crate::pt::{PageSpace, ShootNode};
use crate::types::{PhysAddr, PhysRange, Protection, VirtAddr, PAGE_SIZE};
use crate::work::{WorkQueue, Worklet};

/// Work queue that collects worklets until drained.
pub(crate) struct DeferredQueue {
    work: Mutex<VecDeque<Worklet>>,
}

impl DeferredQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            work: Mutex::new(VecDeque::new()),
        })
    }

    /// Runs queued worklets (including ones they post) to exhaustion.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.work.lock().unwrap().pop_front();
            match next {
                Some(work) => {
                    work();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.work.lock().unwrap().len()
    }
}

impl WorkQueue for DeferredQueue {
    fn post(&self, work: Worklet) {
        self.work.lock().unwrap().push_back(work);
    }
}

/// Physical allocator backed by host allocations; "physical" addresses
/// are the host pointers, so the direct map is the identity.
pub(crate) struct TestPhys {
    allocs: Mutex<HashMap<usize, Layout>>,
    limit: AtomicUsize,
}

impl TestPhys {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            allocs: Mutex::new(HashMap::new()),
            limit: AtomicUsize::new(usize::MAX),
        })
    }

    /// Caps the number of simultaneously outstanding allocations.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn outstanding(&self) -> usize {
        self.allocs.lock().unwrap().len()
    }
}

unsafe impl PhysAccess for TestPhys {
    fn alloc_page(&self) -> Result<PhysAddr> {
        self.alloc_contiguous(PAGE_SIZE, PAGE_SIZE)
    }

    fn alloc_contiguous(&self, size: usize, align: usize) -> Result<PhysAddr> {
        let mut allocs = self.allocs.lock().unwrap();
        if allocs.len() >= self.limit.load(Ordering::Relaxed) {
            return Err(Error::OutOfMemory);
        }

        let layout = Layout::from_size_align(size, align).map_err(|_| Error::OutOfMemory)?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(Error::OutOfMemory);
        }

        allocs.insert(ptr as usize, layout);
        Ok(PhysAddr::new(ptr as usize))
    }

    unsafe fn free(&self, addr: PhysAddr, size: usize) {
        let layout = self
            .allocs
            .lock()
            .unwrap()
            .remove(&addr.as_usize())
            .expect("freeing a range that was never allocated");
        assert_eq!(layout.size(), size, "size mismatch on free");
        unsafe {
            std::alloc::dealloc(addr.as_usize() as *mut u8, layout);
        }
    }

    fn phys_to_virt(&self, addr: PhysAddr) -> *mut u8 {
        addr.as_usize() as *mut u8
    }
}

/// Page table double: a map keyed by page base, with optionally deferred
/// shootdowns for exercising asynchronous unmap/fork paths.
pub(crate) struct TestPageSpace {
    entries: Mutex<BTreeMap<usize, (PhysAddr, Protection)>>,
    work: Arc<dyn WorkQueue>,
    defer_shootdowns: AtomicBool,
    pending_shootdowns: Mutex<Vec<Arc<ShootNode>>>,
    activations: AtomicUsize,
}

impl TestPageSpace {
    pub fn new(work: Arc<dyn WorkQueue>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(BTreeMap::new()),
            work,
            defer_shootdowns: AtomicBool::new(false),
            pending_shootdowns: Mutex::new(Vec::new()),
            activations: AtomicUsize::new(0),
        })
    }

    /// Makes subsequent shootdowns complete only via
    /// [`flush_shootdowns`](Self::flush_shootdowns).
    pub fn defer_shootdowns(&self, defer: bool) {
        self.defer_shootdowns.store(defer, Ordering::Relaxed);
    }

    /// Acknowledges all pending shootdowns, returning how many there
    /// were.
    pub fn flush_shootdowns(&self) -> usize {
        let pending: Vec<_> = self.pending_shootdowns.lock().unwrap().drain(..).collect();
        let count = pending.len();
        for node in pending {
            node.complete(&self.work);
        }
        count
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::Relaxed)
    }

    pub fn mapped_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn entry(&self, va: VirtAddr) -> Option<(PhysAddr, Protection)> {
        self.entries
            .lock()
            .unwrap()
            .get(&va.align_down_page().as_usize())
            .copied()
    }
}

unsafe impl PageSpace for TestPageSpace {
    fn map(&self, va: VirtAddr, phys: PhysAddr, prot: Protection) {
        assert!(va.is_page_aligned());
        self.entries
            .lock()
            .unwrap()
            .insert(va.as_usize(), (phys, prot));
    }

    fn protect(&self, va: VirtAddr, prot: Protection) -> bool {
        match self.entries.lock().unwrap().get_mut(&va.as_usize()) {
            Some(entry) => {
                entry.1 = prot;
                true
            }
            None => false,
        }
    }

    fn unmap(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.entries
            .lock()
            .unwrap()
            .remove(&va.as_usize())
            .map(|(phys, _)| phys)
    }

    fn is_mapped(&self, va: VirtAddr) -> bool {
        self.entries
            .lock()
            .unwrap()
            .contains_key(&va.align_down_page().as_usize())
    }

    fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.entries
            .lock()
            .unwrap()
            .get(&va.align_down_page().as_usize())
            .map(|&(phys, _)| phys + va.page_offset())
    }

    fn shootdown(&self, node: &Arc<ShootNode>) -> bool {
        if self.defer_shootdowns.load(Ordering::Relaxed) {
            self.pending_shootdowns.lock().unwrap().push(Arc::clone(node));
            false
        } else {
            node.complete_inline();
            true
        }
    }

    fn activate(&self) {
        self.activations.fetch_add(1, Ordering::Relaxed);
    }
}

struct GatedState {
    pages: BTreeMap<usize, PhysAddr>,
    pending: Vec<(usize, Arc<FetchNode>)>,
}

/// A bundle whose fetches stay pending until [`release`] is called.
///
/// [`release`]: GatedBundle::release
pub(crate) struct GatedBundle {
    ctx: Arc<VmContext>,
    length: usize,
    state: Mutex<GatedState>,
}

impl GatedBundle {
    pub fn new(ctx: Arc<VmContext>, length: usize) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            length,
            state: Mutex::new(GatedState {
                pages: BTreeMap::new(),
                pending: Vec::new(),
            }),
        })
    }

    /// Completes all pending fetches, allocating zeroed pages on demand.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<_> = state.pending.drain(..).collect();

        let mut completions = Vec::new();
        for (offset, node) in pending {
            let page = offset / PAGE_SIZE;
            let result = match state.pages.get(&page) {
                Some(&phys) => Ok(phys),
                None => self.ctx.phys().alloc_page().map(|phys| {
                    unsafe {
                        self.ctx.zero_range(phys, PAGE_SIZE);
                    }
                    state.pages.insert(page, phys);
                    phys
                }),
            };
            completions.push((offset, node, result));
        }
        drop(state);

        for (offset, node, result) in completions {
            let in_page = offset % PAGE_SIZE;
            node.complete(
                self.ctx.work(),
                result.map(|phys| PhysRange::new(phys + in_page, PAGE_SIZE - in_page)),
            );
        }
    }
}

impl MemoryBundle for GatedBundle {
    fn length(&self) -> usize {
        self.length
    }

    fn peek(&self, offset: usize) -> Option<PhysAddr> {
        if offset >= self.length {
            return None;
        }
        self.state
            .lock()
            .unwrap()
            .pages
            .get(&(offset / PAGE_SIZE))
            .map(|&phys| phys + offset % PAGE_SIZE)
    }

    fn fetch(self: Arc<Self>, offset: usize, node: &Arc<FetchNode>) -> bool {
        if offset >= self.length {
            node.complete_inline(Err(Error::BadAddress));
            return true;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(&phys) = state.pages.get(&(offset / PAGE_SIZE)) {
            let in_page = offset % PAGE_SIZE;
            node.complete_inline(Ok(PhysRange::new(phys + in_page, PAGE_SIZE - in_page)));
            true
        } else {
            state.pending.push((offset, Arc::clone(node)));
            false
        }
    }
}

impl Drop for GatedBundle {
    fn drop(&mut self) {
        for &phys in self.state.lock().unwrap().pages.values() {
            unsafe {
                self.ctx.phys().free(phys, PAGE_SIZE);
            }
        }
    }
}

pub(crate) fn test_ctx() -> (Arc<VmContext>, Arc<TestPhys>, Arc<DeferredQueue>) {
    let phys = TestPhys::new();
    let queue = DeferredQueue::new();
    let ctx = VmContext::new(phys.clone(), queue.clone());
    (ctx, phys, queue)
}

/// A space over `[start, end)` with a fresh page-table double.
pub(crate) fn test_space_full(
    start: usize,
    end: usize,
) -> (
    Arc<VmContext>,
    Arc<TestPhys>,
    Arc<DeferredQueue>,
    Arc<TestPageSpace>,
    Arc<AddressSpace>,
) {
    let (ctx, phys, queue) = test_ctx();
    let pt = TestPageSpace::new(queue.clone());
    let space = AddressSpace::new(
        ctx.clone(),
        pt.clone(),
        VirtAddr::new(start)..VirtAddr::new(end),
    );
    (ctx, phys, queue, pt, space)
}

pub(crate) fn test_space(
    start: usize,
    end: usize,
) -> (
    Arc<VmContext>,
    Arc<TestPhys>,
    Arc<DeferredQueue>,
    Arc<AddressSpace>,
) {
    let (ctx, phys, queue, _pt, space) = test_space_full(start, end);
    (ctx, phys, queue, space)
}
