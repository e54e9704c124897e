use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};
use log::trace;
use num_utils::{align_up, div_ceil};

use crate::bundle::{FetchNode, MemoryBundle};
use crate::err::{Error, Result};
use crate::phys::VmContext;
use crate::sync::SpinLock;
use crate::types::{PhysAddr, PhysRange, PAGE_SIZE};
use crate::work::Completion;

/// Load progress of one page slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    /// No pager transfer has been arranged.
    Missing,
    /// A manage node has been handed out; the physical page is already
    /// reserved.
    Loading,
    /// The page holds pager-provided data and is immutable until
    /// eviction.
    Loaded,
}

/// A client-side load request covering `[offset, offset + length)`.
///
/// Completes once every page in the range is loaded, or with
/// `PagerGone` if the pager disappears first.
pub struct InitiateNode {
    link: LinkedListAtomicLink,
    offset: usize,
    length: usize,
    completion: Completion<Result<()>>,
}

impl InitiateNode {
    pub fn new(offset: usize, length: usize) -> Arc<Self> {
        Arc::new(Self {
            link: LinkedListAtomicLink::new(),
            offset,
            length,
            completion: Completion::new(),
        })
    }

    pub fn with_callback(
        offset: usize,
        length: usize,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            link: LinkedListAtomicLink::new(),
            offset,
            length,
            completion: Completion::with_callback(callback),
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn result(&self) -> Option<Result<()>> {
        self.completion.result()
    }

    fn first_page(&self) -> usize {
        self.offset / PAGE_SIZE
    }

    fn last_page(&self) -> usize {
        div_ceil(self.offset + self.length, PAGE_SIZE)
    }
}

intrusive_adapter!(InitiateAdapter = Arc<InitiateNode>: InitiateNode { link: LinkedListAtomicLink });

/// A pager-side offer to perform one transfer.
///
/// Completes with the `(offset, size)` of the range the pager must load,
/// in pager submission order.
pub struct ManageNode {
    link: LinkedListAtomicLink,
    completion: Completion<Result<(usize, usize)>>,
}

impl ManageNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            link: LinkedListAtomicLink::new(),
            completion: Completion::new(),
        })
    }

    pub fn with_callback(
        callback: impl FnOnce(Result<(usize, usize)>) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            link: LinkedListAtomicLink::new(),
            completion: Completion::with_callback(callback),
        })
    }

    pub fn result(&self) -> Option<Result<(usize, usize)>> {
        self.completion.result()
    }
}

intrusive_adapter!(ManageAdapter = Arc<ManageNode>: ManageNode { link: LinkedListAtomicLink });

/// Deferred completion, delivered after the state lock is dropped.
enum Post {
    Initiate(Arc<InitiateNode>, Result<()>),
    Manage(Arc<ManageNode>, Result<(usize, usize)>),
}

struct ManagedState {
    states: Vec<LoadState>,
    /// Reserved at manage pairing time, valid from `Loading` onwards.
    pages: Vec<Option<PhysAddr>>,
    /// Submitted initiators that have not been scanned yet.
    initiate: LinkedList<InitiateAdapter>,
    /// Scanned initiators waiting for their pages to load.
    pending: LinkedList<InitiateAdapter>,
    /// Manage nodes offered by the pager, not yet paired with work.
    submitted: LinkedList<ManageAdapter>,
    pager_gone: bool,
}

impl ManagedState {
    fn range_loaded(states: &[LoadState], node: &InitiateNode) -> bool {
        states[node.first_page()..node.last_page()]
            .iter()
            .all(|&s| s == LoadState::Loaded)
    }

    /// Finds the lowest missing page demanded by the earliest-submitted
    /// initiator that still has one.
    fn first_demanded_missing(&self) -> Option<usize> {
        self.pending.iter().find_map(|node| {
            (node.first_page()..node.last_page())
                .find(|&page| self.states[page] == LoadState::Missing)
        })
    }
}

/// Externally paged memory: the state machine coupling a kernel-side
/// client (its [`FrontalMemory`] face) to a user-space pager (its
/// [`BackingMemory`] face). Both faces share one physical page vector.
///
/// Physical pages are owned by the managed space, not the pager: if the
/// pager disappears, loaded pages remain usable and outstanding
/// initiators complete with `PagerGone`.
pub struct ManagedSpace {
    ctx: Arc<VmContext>,
    length: usize,
    state: SpinLock<ManagedState>,
    backing_refs: AtomicUsize,
}

impl ManagedSpace {
    /// Creates a managed range of `length` bytes (rounded up to whole
    /// pages), with no pager attached yet.
    pub fn new(ctx: Arc<VmContext>, length: usize) -> Arc<Self> {
        let length = align_up(length, PAGE_SIZE);
        let page_count = length / PAGE_SIZE;

        let mut states = Vec::new();
        states.resize(page_count, LoadState::Missing);
        let mut pages = Vec::new();
        pages.resize(page_count, None);

        Arc::new(Self {
            ctx,
            length,
            state: SpinLock::new(ManagedState {
                states,
                pages,
                initiate: LinkedList::new(InitiateAdapter::new()),
                pending: LinkedList::new(InitiateAdapter::new()),
                submitted: LinkedList::new(ManageAdapter::new()),
                pager_gone: false,
            }),
            backing_refs: AtomicUsize::new(0),
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Matches queued pager offers against demanded missing pages, then
    /// completes every initiator whose range is fully loaded, preserving
    /// FIFO order on both queues. Runs under the state lock; completions
    /// are deferred into `posts`.
    fn progress(&self, state: &mut ManagedState, posts: &mut Vec<Post>) {
        // Newly submitted initiators join the scan queue in order.
        while let Some(node) = state.initiate.pop_front() {
            state.pending.push_back(node);
        }

        while !state.submitted.is_empty() {
            let Some(page) = state.first_demanded_missing() else {
                break;
            };

            let manage = state.submitted.pop_front().unwrap();
            match self.ctx.phys().alloc_page() {
                Ok(phys) => {
                    state.pages[page] = Some(phys);
                    state.states[page] = LoadState::Loading;
                    trace!("pager transfer arranged: page {page} -> {phys}");
                    posts.push(Post::Manage(manage, Ok((page * PAGE_SIZE, PAGE_SIZE))));
                }
                Err(err) => {
                    posts.push(Post::Manage(manage, Err(err)));
                    break;
                }
            }
        }

        let ManagedState {
            states, pending, ..
        } = state;
        let mut cursor = pending.front_mut();
        while let Some(node) = cursor.get() {
            if ManagedState::range_loaded(states, node) {
                let node = cursor.remove().unwrap();
                posts.push(Post::Initiate(node, Ok(())));
            } else {
                cursor.move_next();
            }
        }
    }

    fn deliver(&self, posts: Vec<Post>) {
        for post in posts {
            match post {
                Post::Initiate(node, result) => node.completion.complete(self.ctx.work(), result),
                Post::Manage(node, result) => node.completion.complete(self.ctx.work(), result),
            }
        }
    }

    fn submit_initiate(&self, node: &Arc<InitiateNode>) {
        let mut posts = Vec::new();

        self.state.with(|state| {
            if state.pager_gone {
                posts.push(Post::Initiate(Arc::clone(node), Err(Error::PagerGone)));
                return;
            }
            if node.length == 0 || node.offset + node.length > self.length {
                posts.push(Post::Initiate(Arc::clone(node), Err(Error::BadAddress)));
                return;
            }

            state.initiate.push_back(Arc::clone(node));
            self.progress(state, &mut posts);
        });

        self.deliver(posts);
    }

    fn submit_manage(&self, node: &Arc<ManageNode>) {
        let mut posts = Vec::new();

        self.state.with(|state| {
            if state.pager_gone {
                posts.push(Post::Manage(Arc::clone(node), Err(Error::PagerGone)));
                return;
            }

            state.submitted.push_back(Arc::clone(node));
            self.progress(state, &mut posts);
        });

        self.deliver(posts);
    }

    fn complete_load(&self, offset: usize, length: usize) {
        let mut posts = Vec::new();

        self.state.with(|state| {
            let first = offset / PAGE_SIZE;
            let last = div_ceil(offset + length, PAGE_SIZE).min(state.states.len());
            for page in first..last {
                if state.states[page] == LoadState::Loading {
                    state.states[page] = LoadState::Loaded;
                }
            }

            self.progress(state, &mut posts);
        });

        self.deliver(posts);
    }

    /// Called when the last backing reference is dropped: the user-space
    /// pager is unreachable.
    fn retire_pager(&self) {
        let mut posts = Vec::new();

        self.state.with(|state| {
            state.pager_gone = true;

            while let Some(node) = state.initiate.pop_front() {
                posts.push(Post::Initiate(node, Err(Error::PagerGone)));
            }
            while let Some(node) = state.pending.pop_front() {
                posts.push(Post::Initiate(node, Err(Error::PagerGone)));
            }
            while let Some(node) = state.submitted.pop_front() {
                posts.push(Post::Manage(node, Err(Error::PagerGone)));
            }
        });

        trace!("pager retired, {} nodes flushed", posts.len());
        self.deliver(posts);
    }

    /// Returns the loaded run backing `offset`, failing if the page never
    /// loaded.
    fn loaded_range(&self, offset: usize) -> Result<PhysRange> {
        self.state.with(|state| {
            let page = offset / PAGE_SIZE;
            let in_page = offset % PAGE_SIZE;
            match state.states[page] {
                LoadState::Loaded => {
                    let phys = state.pages[page].expect("loaded page without backing");
                    Ok(PhysRange::new(phys + in_page, PAGE_SIZE - in_page))
                }
                _ => Err(Error::Fault),
            }
        })
    }

    fn peek_loaded(&self, offset: usize) -> Option<PhysAddr> {
        if offset >= self.length {
            return None;
        }

        self.state.with(|state| {
            let page = offset / PAGE_SIZE;
            match state.states[page] {
                LoadState::Loaded => state.pages[page].map(|p| p + offset % PAGE_SIZE),
                _ => None,
            }
        })
    }

    fn frontal_fetch(self: &Arc<Self>, offset: usize, node: &Arc<FetchNode>) -> bool {
        if offset >= self.length {
            node.complete_inline(Err(Error::BadAddress));
            return true;
        }

        enum Path {
            Ready(PhysAddr),
            Gone,
            Load,
        }

        let page = offset / PAGE_SIZE;
        let in_page = offset % PAGE_SIZE;

        let path = self.state.with(|state| match state.states[page] {
            LoadState::Loaded => Path::Ready(state.pages[page].expect("loaded page without backing")),
            _ if state.pager_gone => Path::Gone,
            _ => Path::Load,
        });

        match path {
            Path::Ready(phys) => {
                node.complete_inline(Ok(PhysRange::new(phys + in_page, PAGE_SIZE - in_page)));
                true
            }
            Path::Gone => {
                node.complete_inline(Err(Error::PagerGone));
                true
            }
            Path::Load => {
                let this = Arc::clone(self);
                let fetch = Arc::clone(node);
                let initiate = InitiateNode::with_callback(
                    page * PAGE_SIZE,
                    PAGE_SIZE,
                    move |result| {
                        let result = result.and_then(|()| this.loaded_range(offset));
                        fetch.complete(this.ctx.work(), result);
                    },
                );
                self.submit_initiate(&initiate);
                false
            }
        }
    }
}

impl Drop for ManagedSpace {
    fn drop(&mut self) {
        for page in self.state.get_mut().pages.iter().flatten() {
            // Safety: pages are owned by the managed space and nothing
            // can reference them once the last holder is gone.
            unsafe {
                self.ctx.phys().free(*page, PAGE_SIZE);
            }
        }
    }
}

/// The client face of a [`ManagedSpace`]: may issue load requests, and
/// its fetches wait for the pager to provide data.
pub struct FrontalMemory {
    managed: Arc<ManagedSpace>,
}

impl FrontalMemory {
    pub fn new(managed: Arc<ManagedSpace>) -> Arc<Self> {
        Arc::new(Self { managed })
    }

    pub fn managed(&self) -> &Arc<ManagedSpace> {
        &self.managed
    }

    /// Requests that `[node.offset, node.offset + node.length)` be
    /// loaded. The node completes once every covered page is loaded.
    pub fn submit_initiate_load(&self, node: &Arc<InitiateNode>) {
        self.managed.submit_initiate(node);
    }
}

impl MemoryBundle for FrontalMemory {
    fn length(&self) -> usize {
        self.managed.length()
    }

    fn peek(&self, offset: usize) -> Option<PhysAddr> {
        self.managed.peek_loaded(offset)
    }

    fn fetch(self: Arc<Self>, offset: usize, node: &Arc<FetchNode>) -> bool {
        self.managed.frontal_fetch(offset, node)
    }
}

/// The pager face of a [`ManagedSpace`]: accepts manage offers and load
/// completions. Dropping the last backing face retires the pager.
pub struct BackingMemory {
    managed: Arc<ManagedSpace>,
}

impl BackingMemory {
    pub fn new(managed: Arc<ManagedSpace>) -> Arc<Self> {
        managed.backing_refs.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self { managed })
    }

    pub fn managed(&self) -> &Arc<ManagedSpace> {
        &self.managed
    }

    /// Offers one transfer slot to the core. The node completes with the
    /// `(offset, size)` the pager must load.
    pub fn submit_manage(&self, node: &Arc<ManageNode>) {
        self.managed.submit_manage(node);
    }

    /// Reports that the pager finished loading `[offset, offset +
    /// length)`.
    pub fn complete_load(&self, offset: usize, length: usize) {
        self.managed.complete_load(offset, length);
    }
}

impl MemoryBundle for BackingMemory {
    fn length(&self) -> usize {
        self.managed.length()
    }

    fn peek(&self, offset: usize) -> Option<PhysAddr> {
        self.managed.peek_loaded(offset)
    }

    /// Pager-side access is only valid for pages the pager has already
    /// populated.
    fn fetch(self: Arc<Self>, offset: usize, node: &Arc<FetchNode>) -> bool {
        if offset >= self.managed.length() {
            node.complete_inline(Err(Error::BadAddress));
            return true;
        }

        node.complete_inline(self.managed.loaded_range(offset));
        true
    }
}

impl Drop for BackingMemory {
    fn drop(&mut self) {
        if self.managed.backing_refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.managed.retire_pager();
        }
    }
}
