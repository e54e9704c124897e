//! Memory bundles: objects that provide physical pages for a range of
//! offsets.
//!
//! A bundle is the unit of sharing between address spaces. Concrete
//! bundles cover fixed hardware windows ([`HardwareMemory`]), anonymous
//! zero-filled memory ([`AllocatedMemory`]), externally paged memory
//! ([`ManagedSpace`] with its [`BackingMemory`]/[`FrontalMemory`] faces),
//! and copy-on-write overlays ([`CowBundle`]).

use alloc::sync::Arc;

use crate::err::Result;
use crate::types::{PhysAddr, PhysRange};
use crate::work::{Completion, WorkQueue};

mod allocated;
mod cow;
mod hardware;
mod managed;

pub use allocated::AllocatedMemory;
pub use cow::{CowBundle, CowParent};
pub use hardware::HardwareMemory;
pub use managed::{BackingMemory, FrontalMemory, InitiateNode, ManageNode, ManagedSpace};

/// Completion record for one bundle fetch.
///
/// On success the node carries the largest contiguous physical run
/// starting at the requested offset; callers must not assume it covers a
/// whole page.
pub struct FetchNode {
    completion: Completion<Result<PhysRange>>,
}

impl FetchNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            completion: Completion::new(),
        })
    }

    pub fn with_callback(
        callback: impl FnOnce(Result<PhysRange>) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            completion: Completion::with_callback(callback),
        })
    }

    pub fn result(&self) -> Option<Result<PhysRange>> {
        self.completion.result()
    }

    pub(crate) fn complete_inline(&self, result: Result<PhysRange>) {
        self.completion.complete_inline(result);
    }

    pub(crate) fn complete(&self, queue: &Arc<dyn WorkQueue>, result: Result<PhysRange>) {
        self.completion.complete(queue, result);
    }
}

/// A logical offset → physical page function with lifetime.
///
/// Bundles are shared and reference-counted; dropping the last holder
/// releases any owned pages back to the physical allocator. Pages handed
/// out by `peek`/`fetch` are stable until cooperatively evicted, and the
/// core never evicts a page a mapping still references.
pub trait MemoryBundle: Send + Sync {
    /// Length of the bundle in bytes.
    fn length(&self) -> usize;

    /// Returns the backing physical address for `offset` if it happens to
    /// be present. Never consults a parent and never allocates.
    fn peek(&self, offset: usize) -> Option<PhysAddr>;

    /// Requests the physical run backing `offset`.
    ///
    /// Returns `true` if the node was completed synchronously (possibly
    /// with an error); otherwise the node's callback is posted once the
    /// range becomes present.
    fn fetch(self: Arc<Self>, offset: usize, node: &Arc<FetchNode>) -> bool;

    /// Grows the bundle. Only supported by bundle types that own
    /// resizable storage.
    fn resize(&self, new_length: usize) -> Result<()> {
        let _ = new_length;
        Err(crate::err::Error::Fault)
    }
}

impl core::fmt::Debug for dyn MemoryBundle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryBundle")
            .field("length", &self.length())
            .finish()
    }
}
