use alloc::sync::Arc;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};

use crate::err::Result;
use crate::sync::SpinLock;
use crate::types::VirtAddr;
use crate::work::{Completion, WorkQueue};

/// A queued futex waiter.
pub struct FutexNode {
    link: LinkedListAtomicLink,
    address: VirtAddr,
    completion: Completion<Result<()>>,
}

impl FutexNode {
    pub fn new(address: VirtAddr) -> Arc<Self> {
        Arc::new(Self {
            link: LinkedListAtomicLink::new(),
            address,
            completion: Completion::new(),
        })
    }

    pub fn with_callback(
        address: VirtAddr,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            link: LinkedListAtomicLink::new(),
            address,
            completion: Completion::with_callback(callback),
        })
    }

    pub fn address(&self) -> VirtAddr {
        self.address
    }

    pub fn result(&self) -> Option<Result<()>> {
        self.completion.result()
    }
}

intrusive_adapter!(FutexAdapter = Arc<FutexNode>: FutexNode { link: LinkedListAtomicLink });

/// Per-address-space futex waiter table, keyed by virtual address.
///
/// The table lock spans the userspace value comparison and the enqueue,
/// so a wake between the two cannot be missed.
pub(super) struct FutexTable {
    waiters: SpinLock<LinkedList<FutexAdapter>>,
}

impl FutexTable {
    pub(super) fn new() -> Self {
        Self {
            waiters: SpinLock::new(LinkedList::new(FutexAdapter::new())),
        }
    }

    /// Queues `node` if `current()` still reads `expected`.
    ///
    /// Returns `true` (node completed inline) when the value already
    /// differs or the read fails; `false` when the waiter was queued.
    pub(super) fn wait(
        &self,
        node: &Arc<FutexNode>,
        expected: u32,
        current: impl FnOnce() -> Result<u32>,
    ) -> bool {
        let queued = self.waiters.with(|waiters| match current() {
            Ok(value) if value == expected => {
                waiters.push_back(Arc::clone(node));
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(err) => Err(err),
        });

        match queued {
            Ok(true) => false,
            Ok(false) => {
                node.completion.complete_inline(Ok(()));
                true
            }
            Err(err) => {
                node.completion.complete_inline(Err(err));
                true
            }
        }
    }

    /// Wakes up to `count` waiters on `address`, FIFO, returning how many
    /// were woken.
    pub(super) fn wake(
        &self,
        queue: &Arc<dyn WorkQueue>,
        address: VirtAddr,
        count: usize,
    ) -> usize {
        let mut woken = alloc::vec::Vec::new();

        self.waiters.with(|waiters| {
            let mut cursor = waiters.front_mut();
            while let Some(node) = cursor.get() {
                if woken.len() == count {
                    break;
                }
                if node.address == address {
                    woken.push(cursor.remove().unwrap());
                } else {
                    cursor.move_next();
                }
            }
        });

        let n = woken.len();
        for node in woken {
            node.completion.complete(queue, Ok(()));
        }
        n
    }
}
