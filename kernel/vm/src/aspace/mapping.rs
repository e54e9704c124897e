use alloc::sync::{Arc, Weak};

use bitflags::bitflags;
use intrusive_collections::{intrusive_adapter, KeyAdapter, RBTreeAtomicLink};

use crate::bundle::{CowBundle, MemoryBundle};
use crate::err::Result;
use crate::sync::SpinLock;
use crate::types::{Protection, VirtAddr};
use crate::view::VirtualView;

use super::AddressSpace;

bitflags! {
    /// Behavior flags of one mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Drive a fault over every page right after installation.
        const POPULATE = 1 << 0;
        /// Allow the mapping to extend past the view's backing; faults
        /// beyond it fail instead of the map call.
        const DONT_REQUIRE_BACKING = 1 << 1;
        /// Install the mapping copy-on-write from the start.
        const COW = 1 << 2;
        /// Leave the mapping out of forked children (the default).
        const FORK_DROP = 1 << 3;
        /// Forked children share the same backing.
        const FORK_SHARE = 1 << 4;
        /// Forked children receive a copy-on-write snapshot.
        const FORK_COW = 1 << 5;
    }
}

/// What happens to a mapping when its address space forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkDisposition {
    Drop,
    Share,
    CopyOnWrite,
}

/// How a mapping reaches physical memory.
pub(crate) enum MappingBacking {
    /// A windowed view of some bundle; the common case.
    Normal {
        view: Arc<dyn VirtualView>,
        offset: usize,
    },
    /// The top layer of a copy-on-write chain.
    Cow { bundle: Arc<CowBundle> },
}

impl Clone for MappingBacking {
    fn clone(&self) -> Self {
        match self {
            MappingBacking::Normal { view, offset } => MappingBacking::Normal {
                view: Arc::clone(view),
                offset: *offset,
            },
            MappingBacking::Cow { bundle } => MappingBacking::Cow {
                bundle: Arc::clone(bundle),
            },
        }
    }
}

impl MappingBacking {
    /// Resolves a mapping-relative offset to a bundle range.
    pub(crate) fn resolve(
        &self,
        offset: usize,
        size: usize,
        mapping_length: usize,
    ) -> Result<(Arc<dyn MemoryBundle>, usize, usize)> {
        match self {
            MappingBacking::Normal { view, offset: view_offset } => {
                view.resolve_range(view_offset + offset, size)
            }
            MappingBacking::Cow { bundle } => {
                let usable = size.min(mapping_length - offset);
                let bundle: Arc<dyn MemoryBundle> = bundle.clone() as Arc<dyn MemoryBundle>;
                Ok((bundle, offset, usable))
            }
        }
    }
}

pub(crate) struct MappingInner {
    pub backing: MappingBacking,
    pub prot: Protection,
    /// Cleared (under the space lock) when an unmap begins; the fault
    /// completion path refuses to install translations afterwards.
    pub installed: bool,
    /// Bumped whenever the backing or protection changes, so an
    /// in-flight fault can detect that its resolution went stale.
    pub version: u64,
}

/// An installed region of an address space.
///
/// Mappings are keyed by start address in the owning space's tree; the
/// back-reference to the space is weak, since the space outlives its
/// mappings by construction.
pub struct Mapping {
    link: RBTreeAtomicLink,
    space: Weak<AddressSpace>,
    start: VirtAddr,
    length: usize,
    flags: MapFlags,
    inner: SpinLock<MappingInner>,
}

impl Mapping {
    pub(crate) fn new(
        space: Weak<AddressSpace>,
        start: VirtAddr,
        length: usize,
        prot: Protection,
        flags: MapFlags,
        backing: MappingBacking,
    ) -> Arc<Self> {
        Arc::new(Self {
            link: RBTreeAtomicLink::new(),
            space,
            start,
            length,
            flags,
            inner: SpinLock::new(MappingInner {
                backing,
                prot,
                installed: true,
                version: 0,
            }),
        })
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn end(&self) -> VirtAddr {
        self.start + self.length
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn prot(&self) -> Protection {
        self.inner.with(|inner| inner.prot)
    }

    pub fn space(&self) -> Weak<AddressSpace> {
        Weak::clone(&self.space)
    }

    pub fn fork_disposition(&self) -> ForkDisposition {
        if self.flags.contains(MapFlags::FORK_SHARE) {
            ForkDisposition::Share
        } else if self.flags.contains(MapFlags::FORK_COW) {
            ForkDisposition::CopyOnWrite
        } else {
            ForkDisposition::Drop
        }
    }

    /// Resolves `offset` within this mapping to a bundle range.
    pub fn resolve_range(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<(Arc<dyn MemoryBundle>, usize, usize)> {
        self.backing().resolve(offset, size, self.length)
    }

    pub(crate) fn backing(&self) -> MappingBacking {
        self.inner.with(|inner| inner.backing.clone())
    }

    pub(crate) fn set_backing(&self, backing: MappingBacking) {
        self.inner.with(|inner| {
            inner.backing = backing;
            inner.version += 1;
        });
    }

    pub(crate) fn set_prot(&self, prot: Protection) {
        self.inner.with(|inner| {
            inner.prot = prot;
            inner.version += 1;
        });
    }

    pub(crate) fn installed(&self) -> bool {
        self.inner.with(|inner| inner.installed)
    }

    pub(crate) fn set_installed(&self, installed: bool) {
        self.inner.with(|inner| inner.installed = installed);
    }

    /// Protection, backing, liveness, and version in one consistent
    /// snapshot.
    pub(crate) fn snapshot(&self) -> (Protection, MappingBacking, bool, u64) {
        self.inner.with(|inner| {
            (
                inner.prot,
                inner.backing.clone(),
                inner.installed,
                inner.version,
            )
        })
    }

    pub(crate) fn version(&self) -> u64 {
        self.inner.with(|inner| inner.version)
    }
}

intrusive_adapter!(pub MappingAdapter = Arc<Mapping>: Mapping { link: RBTreeAtomicLink });

impl<'a> KeyAdapter<'a> for MappingAdapter {
    type Key = VirtAddr;

    fn get_key(&self, mapping: &'a Mapping) -> Self::Key {
        mapping.start()
    }
}
