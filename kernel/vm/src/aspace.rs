//! Address spaces: hole and mapping bookkeeping, fault handling, and
//! fork-style duplication.
//!
//! An address space owns a [`HoleTree`](holes::HoleTree) and a mapping
//! tree covering exactly its user range (their intervals partition it),
//! plus the machine page table behind a [`PageSpace`] handle. The space
//! lock serializes `map`/`unmap`/`protect`/`fork`; faults take it only to
//! look up and validate, and drop it across fetches.

use core::ops::Range;

use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use intrusive_collections::{Bound, RBTree};
use log::{debug, trace};
use num_utils::is_aligned;

use crate::bundle::{CowBundle, CowParent, FetchNode};
use crate::err::{Error, Result};
use crate::phys::VmContext;
use crate::pt::{PageSpace, ShootNode, ShootRequest, MAX_SHOOT_PAGES};
use crate::sync::SpinLock;
use crate::types::{AccessType, PhysRange, Protection, VirtAddr, PAGE_SIZE};
use crate::view::VirtualView;
use crate::work::Completion;

mod futex;
mod holes;
mod mapping;

use self::holes::{HolePolicy, HoleTree};
use self::mapping::{MappingAdapter, MappingBacking};

pub use self::futex::FutexNode;
pub use self::mapping::{ForkDisposition, MapFlags, Mapping};

/// Placement constraint for a new mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapBase {
    /// The mapping must cover exactly this base address.
    Fixed(VirtAddr),
    /// Best-fit, preferring the lowest fitting hole.
    PreferBottom,
    /// Best-fit, preferring the highest fitting hole.
    PreferTop,
}

/// Completion record of one fault. Resolved ⇔ the completion carries
/// `Ok`; errors (including `OutOfMemory`) surface as unresolved faults.
pub struct FaultNode {
    completion: Completion<Result<()>>,
}

impl FaultNode {
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

    pub fn resolved(&self) -> bool {
        matches!(self.completion.result(), Some(Ok(())))
    }
}

/// Completion record of one unmap; posted once TLB shootdown has
/// acknowledged and the region has returned to the hole tree.
pub struct UnmapNode {
    completion: Completion<Result<()>>,
}

impl UnmapNode {
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

/// Completion record of one protection change.
pub struct ProtectNode {
    completion: Completion<Result<()>>,
}

impl ProtectNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            completion: Completion::new(),
        })
    }

    pub fn result(&self) -> Option<Result<()>> {
        self.completion.result()
    }
}

/// Completion record of one fork; carries the child space.
pub struct ForkNode {
    completion: Completion<Result<Arc<AddressSpace>>>,
}

impl ForkNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            completion: Completion::new(),
        })
    }

    pub fn with_callback(
        callback: impl FnOnce(Result<Arc<AddressSpace>>) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            completion: Completion::with_callback(callback),
        })
    }

    pub fn result(&self) -> Option<Result<Arc<AddressSpace>>> {
        self.completion.result()
    }
}

enum FaultStep {
    /// The node was completed (successfully or not).
    Completed,
    /// The fetch went asynchronous; completion arrives via the queue.
    Suspended,
    /// The mapping changed under the fault; run it again.
    Stale,
}

enum FaultOutcome {
    Done(Result<()>),
    Stale,
}

struct AspaceState {
    holes: HoleTree,
    mappings: RBTree<MappingAdapter>,
}

impl AspaceState {
    fn find_mapping(&self, address: VirtAddr) -> Option<Arc<Mapping>> {
        let cursor = self.mappings.upper_bound(Bound::Included(&address));
        cursor
            .get()
            .filter(|mapping| address < mapping.end())
            .and_then(|_| cursor.clone_pointer())
    }
}

/// One user address space.
pub struct AddressSpace {
    start: VirtAddr,
    length: usize,
    ctx: Arc<VmContext>,
    ops: Arc<dyn PageSpace>,
    state: SpinLock<AspaceState>,
    futex: futex::FutexTable,
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("start", &self.start)
            .field("length", &self.length)
            .finish()
    }
}

impl PartialEq for AddressSpace {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl AddressSpace {
    /// Creates an address space spanning `range`, initially one maximal
    /// hole.
    ///
    /// # Panics
    ///
    /// Panics if `range` is empty or not page-aligned.
    pub fn new(ctx: Arc<VmContext>, ops: Arc<dyn PageSpace>, range: Range<VirtAddr>) -> Arc<Self> {
        assert!(range.end > range.start);
        assert!(range.start.is_page_aligned() && range.end.is_page_aligned());

        let length = range.end - range.start;
        let mut holes = HoleTree::new();
        holes.insert(range.start.as_usize(), length);

        Arc::new(Self {
            start: range.start,
            length,
            ctx,
            ops,
            state: SpinLock::new(AspaceState {
                holes,
                mappings: RBTree::new(MappingAdapter::new()),
            }),
            futex: futex::FutexTable::new(),
        })
    }

    pub fn range(&self) -> Range<VirtAddr> {
        self.start..self.start + self.length
    }

    pub fn ctx(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    pub fn ops(&self) -> &Arc<dyn PageSpace> {
        &self.ops
    }

    /// Switches the executing CPU to this space's page table.
    pub fn activate(&self) {
        self.ops.activate();
    }

    /// Maps `length` bytes of `view` starting at `offset` into this
    /// space.
    ///
    /// Page tables are not populated eagerly; faults fill them in.
    /// With [`MapFlags::POPULATE`], a fault is driven over every page
    /// before returning (pager-backed pages finish asynchronously).
    ///
    /// # Errors
    ///
    /// * `BadAddress` - unaligned offset/length, or a fixed base that is
    ///   not available.
    /// * `BufferTooSmall` - the view cannot back the whole mapping and
    ///   [`MapFlags::DONT_REQUIRE_BACKING`] was not given.
    /// * `OutOfMemory` - no hole of the requested size exists.
    pub fn map(
        self: &Arc<Self>,
        view: Arc<dyn VirtualView>,
        base: MapBase,
        offset: usize,
        length: usize,
        prot: Protection,
        flags: MapFlags,
    ) -> Result<VirtAddr> {
        if length == 0 || !is_aligned(length, PAGE_SIZE) || !is_aligned(offset, PAGE_SIZE) {
            return Err(Error::BadAddress);
        }
        if !flags.contains(MapFlags::DONT_REQUIRE_BACKING)
            && (offset > view.length() || length > view.length() - offset)
        {
            return Err(Error::BufferTooSmall);
        }

        let backing = if flags.contains(MapFlags::COW) {
            let bundle = CowBundle::new(
                Arc::clone(&self.ctx),
                CowParent::View(view),
                offset,
                length,
            )?;
            MappingBacking::Cow { bundle }
        } else {
            MappingBacking::Normal { view, offset }
        };

        let actual = self.state.with(|state| {
            let actual = match base {
                MapBase::Fixed(va) => {
                    if !va.is_page_aligned() {
                        return Err(Error::BadAddress);
                    }
                    state.holes.allocate_fixed(va.as_usize(), length)?;
                    va
                }
                MapBase::PreferBottom => {
                    VirtAddr::new(state.holes.allocate(length, HolePolicy::Bottom)?)
                }
                MapBase::PreferTop => {
                    VirtAddr::new(state.holes.allocate(length, HolePolicy::Top)?)
                }
            };

            let mapping = Mapping::new(
                Arc::downgrade(self),
                actual,
                length,
                prot,
                flags,
                backing,
            );
            state.mappings.insert(mapping);
            Ok(actual)
        })?;

        debug!("map {actual}+{length:#x} prot={prot:?}");

        if flags.contains(MapFlags::POPULATE) {
            for page in 0..length / PAGE_SIZE {
                let node = FaultNode::new();
                self.handle_fault(actual + page * PAGE_SIZE, AccessType::Read, &node);
            }
        }

        Ok(actual)
    }

    /// Unmaps the mapping covering exactly `[address, address +
    /// length)`.
    ///
    /// Partial unmap is rejected: the range must coincide with one whole
    /// mapping. Present translations are torn down immediately; the
    /// mapping is removed from the tree and its interval returned to the
    /// hole tree only once TLB shootdown acknowledges, after which `node`
    /// completes.
    pub fn unmap(self: &Arc<Self>, address: VirtAddr, length: usize, node: &Arc<UnmapNode>) -> bool {
        let prep = self.state.with(|state| {
            let mapping = state.find_mapping(address).ok_or(Error::BadAddress)?;
            if mapping.start() != address || mapping.length() != length || !mapping.installed() {
                return Err(Error::BadAddress);
            }

            mapping.set_installed(false);
            let request = self.teardown_pages(address, length);
            Ok((mapping, request))
        });

        let (mapping, request) = match prep {
            Ok(prep) => prep,
            Err(err) => {
                node.completion.complete_inline(Err(err));
                return true;
            }
        };

        debug!("unmap {address}+{length:#x}");

        let this = Arc::clone(self);
        let retired = Arc::clone(&mapping);
        let unmap_node = Arc::clone(node);
        let shoot = ShootNode::with_callback(request, move || {
            this.finish_unmap(&retired);
            unmap_node.completion.complete(this.ctx.work(), Ok(()));
        });

        if self.ops.shootdown(&shoot) {
            self.finish_unmap(&mapping);
            node.completion.complete_inline(Ok(()));
            true
        } else {
            false
        }
    }

    /// Changes the protection of the mapping covering exactly
    /// `[address, address + length)`. Installed translations are
    /// downgraded in place; `node` completes once shootdown acknowledges.
    pub fn protect(
        self: &Arc<Self>,
        address: VirtAddr,
        length: usize,
        prot: Protection,
        node: &Arc<ProtectNode>,
    ) -> bool {
        let prep = self.state.with(|state| {
            let mapping = state.find_mapping(address).ok_or(Error::BadAddress)?;
            if mapping.start() != address || mapping.length() != length || !mapping.installed() {
                return Err(Error::BadAddress);
            }

            mapping.set_prot(prot);
            Ok(self.downgrade_pages(address, length, prot))
        });

        let request = match prep {
            Ok(request) => request,
            Err(err) => {
                node.completion.complete_inline(Err(err));
                return true;
            }
        };

        let this = Arc::clone(self);
        let protect_node = Arc::clone(node);
        let shoot = ShootNode::with_callback(request, move || {
            protect_node.completion.complete(this.ctx.work(), Ok(()));
        });

        if self.ops.shootdown(&shoot) {
            node.completion.complete_inline(Ok(()));
            true
        } else {
            false
        }
    }

    /// Handles a fault at `address` with access kind `access`.
    ///
    /// The space lock is held only for lookup and validation; the fetch
    /// runs without it. The completion path revalidates that the mapping
    /// is still installed and unchanged before touching the page table;
    /// a fault whose resolution went stale (the backing was bumped to
    /// copy-on-write by a concurrent fork, say) is transparently retried.
    pub fn handle_fault(
        self: &Arc<Self>,
        address: VirtAddr,
        access: AccessType,
        node: &Arc<FaultNode>,
    ) -> bool {
        loop {
            match self.fault_step(address, access, node, true) {
                FaultStep::Completed => return true,
                FaultStep::Suspended => return false,
                FaultStep::Stale => continue,
            }
        }
    }

    /// Re-drives a fault from a completion context; the node completes
    /// through the work queue.
    fn fault_async(self: &Arc<Self>, address: VirtAddr, access: AccessType, node: &Arc<FaultNode>) {
        loop {
            match self.fault_step(address, access, node, false) {
                FaultStep::Completed | FaultStep::Suspended => return,
                FaultStep::Stale => continue,
            }
        }
    }

    fn fault_step(
        self: &Arc<Self>,
        address: VirtAddr,
        access: AccessType,
        node: &Arc<FaultNode>,
        inline: bool,
    ) -> FaultStep {
        let prep = self.state.with(|state| {
            let mapping = state.find_mapping(address).ok_or(Error::BadAddress)?;
            let (prot, backing, installed, version) = mapping.snapshot();
            if !installed {
                return Err(Error::BadAddress);
            }
            if !access.allowed_by(prot) {
                return Err(Error::AccessDenied);
            }
            Ok((mapping, prot, backing, version))
        });

        let (mapping, prot, backing, version) = match prep {
            Ok(prep) => prep,
            Err(err) => {
                self.complete_fault(node, Err(err), inline);
                return FaultStep::Completed;
            }
        };

        trace!("fault at {address} ({access:?})");

        let page_va = address.align_down_page();
        let page_offset = page_va - mapping.start();

        let (bundle, bundle_offset) =
            match backing.resolve(page_offset, PAGE_SIZE, mapping.length()) {
                Ok((bundle, bundle_offset, _usable)) => (bundle, bundle_offset),
                Err(err) => {
                    self.complete_fault(node, Err(err), inline);
                    return FaultStep::Completed;
                }
            };

        let this = Arc::clone(self);
        let faulted = Arc::clone(&mapping);
        let fault_node = Arc::clone(node);
        let fetch = FetchNode::with_callback(move |result| {
            match this.finish_fault(&faulted, page_va, prot, version, result) {
                FaultOutcome::Done(outcome) => {
                    fault_node.completion.complete(this.ctx.work(), outcome)
                }
                FaultOutcome::Stale => this.fault_async(address, access, &fault_node),
            }
        });

        if bundle.fetch(bundle_offset, &fetch) {
            let result = fetch
                .result()
                .expect("synchronous fetch completed without result");
            match self.finish_fault(&mapping, page_va, prot, version, result) {
                FaultOutcome::Done(outcome) => {
                    self.complete_fault(node, outcome, inline);
                    FaultStep::Completed
                }
                FaultOutcome::Stale => FaultStep::Stale,
            }
        } else {
            FaultStep::Suspended
        }
    }

    fn complete_fault(&self, node: &Arc<FaultNode>, result: Result<()>, inline: bool) {
        if inline {
            node.completion.complete_inline(result);
        } else {
            node.completion.complete(self.ctx.work(), result);
        }
    }

    /// Duplicates this space into a new one backed by `dest_ops`,
    /// honoring each mapping's fork disposition.
    ///
    /// Structural duplication happens under the space lock; afterwards
    /// the present pages of every mapping converted to copy-on-write are
    /// downgraded to read-only, one shootdown per mapping, chained
    /// asynchronously. `node` completes with the child space.
    pub fn fork(self: &Arc<Self>, dest_ops: Arc<dyn PageSpace>, node: &Arc<ForkNode>) -> bool {
        let dest = AddressSpace::new(Arc::clone(&self.ctx), dest_ops, self.range());

        let converted = self.state.with(|state| {
            let mut converted = Vec::new();

            let mut cursor = state.mappings.front();
            while let Some(mapping) = cursor.get() {
                let arc = cursor.clone_pointer().expect("cursor lost its mapping");
                match mapping.fork_disposition() {
                    ForkDisposition::Drop => {}
                    ForkDisposition::Share => {
                        dest.adopt_mapping(&arc, arc.backing());
                    }
                    ForkDisposition::CopyOnWrite => match arc.backing() {
                        MappingBacking::Normal { view, offset } => {
                            // Both sides move to private layers over the
                            // original window, so writes on either side
                            // copy rather than land in shared pages.
                            let src_bundle = CowBundle::new(
                                Arc::clone(&self.ctx),
                                CowParent::View(Arc::clone(&view)),
                                offset,
                                arc.length(),
                            )?;
                            let dst_bundle = CowBundle::new(
                                Arc::clone(&self.ctx),
                                CowParent::View(view),
                                offset,
                                arc.length(),
                            )?;
                            arc.set_backing(MappingBacking::Cow { bundle: src_bundle });
                            dest.adopt_mapping(&arc, MappingBacking::Cow { bundle: dst_bundle });
                            converted.push(Arc::clone(&arc));
                        }
                        MappingBacking::Cow { bundle } => {
                            // The child gets a fresh layer over the
                            // current chain; the source keeps writing
                            // through its own top layer.
                            dest.adopt_mapping(
                                &arc,
                                MappingBacking::Cow {
                                    bundle: bundle.make_child(),
                                },
                            );
                        }
                    },
                }
                cursor.move_next();
            }

            Ok(converted)
        });

        let converted = match converted {
            Ok(converted) => converted,
            Err(err) => {
                node.completion.complete_inline(Err(err));
                return true;
            }
        };

        debug!("fork: {} mapping(s) bumped to copy-on-write", converted.len());

        if converted.is_empty() {
            node.completion.complete_inline(Ok(dest));
            return true;
        }

        let progress = Arc::new(ForkProgress {
            source: Arc::clone(self),
            dest,
            remaining: SpinLock::new(converted),
            node: Arc::clone(node),
        });
        ForkProgress::advance(progress);
        false
    }

    /// Installs a copy of `mapping` (with `backing`) into this freshly
    /// forked space.
    fn adopt_mapping(self: &Arc<Self>, mapping: &Mapping, backing: MappingBacking) {
        self.state.with(|state| {
            state
                .holes
                .allocate_fixed(mapping.start().as_usize(), mapping.length())
                .expect("fork destination layout collision");
            state.mappings.insert(Mapping::new(
                Arc::downgrade(self),
                mapping.start(),
                mapping.length(),
                mapping.prot(),
                mapping.flags(),
                backing,
            ));
        });
    }

    /// Queues `node` until the `u32` at `address` no longer reads
    /// `expected`.
    ///
    /// The value is read through the installed translation; the
    /// comparison and the enqueue are atomic with respect to
    /// [`futex_wake`](Self::futex_wake). Completes inline with
    /// `BadAddress` if `address` is unaligned or untranslated.
    pub fn futex_wait(&self, address: VirtAddr, expected: u32, node: &Arc<FutexNode>) -> bool {
        self.futex.wait(node, expected, || {
            if !is_aligned(address.as_usize(), core::mem::size_of::<u32>()) {
                return Err(Error::BadAddress);
            }
            let phys = self.ops.translate(address).ok_or(Error::BadAddress)?;
            let ptr = self.ctx.phys().phys_to_virt(phys) as *const u32;
            // Safety: the translation pins a live physical page; the
            // read races only with userspace stores, which volatile
            // tolerates.
            Ok(unsafe { core::ptr::read_volatile(ptr) })
        })
    }

    /// Wakes up to `count` waiters queued on `address`, in FIFO order.
    pub fn futex_wake(&self, address: VirtAddr, count: usize) -> usize {
        self.futex.wake(self.ctx.work(), address, count)
    }

    /// Installs the fetched page, unless the mapping was unmapped or its
    /// backing changed while the fetch was in flight.
    fn finish_fault(
        &self,
        mapping: &Mapping,
        page_va: VirtAddr,
        prot: Protection,
        version: u64,
        fetch_result: Result<PhysRange>,
    ) -> FaultOutcome {
        let range = match fetch_result {
            Ok(range) => range,
            Err(err) => return FaultOutcome::Done(Err(err)),
        };

        self.state.with(|_state| {
            if !mapping.installed() {
                return FaultOutcome::Done(Err(Error::BadAddress));
            }
            if mapping.version() != version {
                return FaultOutcome::Stale;
            }
            self.ops.map(page_va, range.addr, prot);
            FaultOutcome::Done(Ok(()))
        })
    }

    /// Removes a retired mapping from the tree and returns its interval
    /// to the hole tree. Runs once shootdown has acknowledged.
    fn finish_unmap(&self, mapping: &Arc<Mapping>) {
        self.state.with(|state| {
            let mut cursor = state.mappings.find_mut(&mapping.start());
            cursor.remove().expect("retired mapping vanished from tree");
            state
                .holes
                .free(mapping.start().as_usize(), mapping.length());
        });
    }

    /// Tears down every installed translation in the range, gathering
    /// per-page invalidations until the bounded gather overflows into a
    /// full-range request.
    fn teardown_pages(&self, address: VirtAddr, length: usize) -> ShootRequest {
        let mut pages: ArrayVec<VirtAddr, MAX_SHOOT_PAGES> = ArrayVec::new();
        let mut overflow = false;

        for page in 0..length / PAGE_SIZE {
            let va = address + page * PAGE_SIZE;
            if self.ops.unmap(va).is_some() && pages.try_push(va).is_err() {
                overflow = true;
            }
        }

        if overflow {
            ShootRequest::Range { address, size: length }
        } else {
            ShootRequest::Pages(pages)
        }
    }

    /// Downgrades every installed translation in the range to `prot`.
    fn downgrade_pages(&self, address: VirtAddr, length: usize, prot: Protection) -> ShootRequest {
        let mut pages: ArrayVec<VirtAddr, MAX_SHOOT_PAGES> = ArrayVec::new();
        let mut overflow = false;

        for page in 0..length / PAGE_SIZE {
            let va = address + page * PAGE_SIZE;
            if self.ops.protect(va, prot) && pages.try_push(va).is_err() {
                overflow = true;
            }
        }

        if overflow {
            ShootRequest::Range { address, size: length }
        } else {
            ShootRequest::Pages(pages)
        }
    }

    /// Asserts that holes and mappings partition the user range exactly.
    #[cfg(test)]
    pub(crate) fn audit_partition(&self) {
        self.state.with(|state| {
            let mut intervals: Vec<(usize, usize)> = Vec::new();
            state.holes.for_each(|addr, len| intervals.push((addr, len)));

            let mut cursor = state.mappings.front();
            while let Some(mapping) = cursor.get() {
                intervals.push((mapping.start().as_usize(), mapping.length()));
                cursor.move_next();
            }

            intervals.sort_unstable();
            let mut expected = self.start.as_usize();
            for (addr, len) in intervals {
                assert_eq!(addr, expected, "gap or overlap at {addr:#x}");
                expected = addr + len;
            }
            assert_eq!(expected, self.start.as_usize() + self.length);
        });
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Uninstall everything before the page table goes away.
        let ops = Arc::clone(&self.ops);
        let state = self.state.get_mut();
        {
            let mut cursor = state.mappings.front_mut();
            while let Some(mapping) = cursor.get() {
                mapping.set_installed(false);
                for page in 0..mapping.length() / PAGE_SIZE {
                    ops.unmap(mapping.start() + page * PAGE_SIZE);
                }
                cursor.move_next();
            }
        }
        state.mappings.clear();
    }
}

/// Chains the per-mapping read-only downgrade that follows the
/// structural phase of a fork.
struct ForkProgress {
    source: Arc<AddressSpace>,
    dest: Arc<AddressSpace>,
    remaining: SpinLock<Vec<Arc<Mapping>>>,
    node: Arc<ForkNode>,
}

impl ForkProgress {
    fn advance(this: Arc<Self>) {
        loop {
            let Some(mapping) = this.remaining.with(|remaining| remaining.pop()) else {
                this.node.completion.complete(
                    this.source.ctx.work(),
                    Ok(Arc::clone(&this.dest)),
                );
                return;
            };

            let read_only = mapping.prot().difference(Protection::WRITE);
            let request = this.source.state.with(|_state| {
                this.source
                    .downgrade_pages(mapping.start(), mapping.length(), read_only)
            });

            let next = Arc::clone(&this);
            let shoot = ShootNode::with_callback(request, move || {
                ForkProgress::advance(next);
            });

            if !this.source.ops.shootdown(&shoot) {
                return;
            }
        }
    }
}
