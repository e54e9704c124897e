//! Asynchronous completion plumbing.
//!
//! No operation in this crate blocks the calling thread. An operation
//! that may suspend takes a caller-allocated node and either completes it
//! synchronously (returning `true`) or arranges for the node's callback
//! to be posted to the work queue once the operation finishes (returning
//! `false`). Nodes are reference-counted, so a completion holder always
//! outlives the operation it was submitted to; submitted nodes are not
//! cancellable.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::sync::SpinLock;

/// A single-shot deferred piece of work.
pub type Worklet = Box<dyn FnOnce() + Send>;

/// Completion delivery service.
///
/// Worklets posted from one submission context must run in posting order;
/// completion ordering guarantees in this crate are expressed in terms of
/// post order.
pub trait WorkQueue: Send + Sync {
    fn post(&self, work: Worklet);
}

type Callback<T> = Box<dyn FnOnce(T) + Send>;

struct CompletionInner<T> {
    callback: Option<Callback<T>>,
    result: Option<T>,
}

/// Shared state of one work node: an optional continuation plus the
/// operation's result.
///
/// The callback, if any, must be installed before the node is submitted;
/// installing it later races with completion.
pub struct Completion<T> {
    inner: SpinLock<CompletionInner<T>>,
}

impl<T: Clone + Send + 'static> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(CompletionInner {
                callback: None,
                result: None,
            }),
        }
    }

    pub fn with_callback(callback: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            inner: SpinLock::new(CompletionInner {
                callback: Some(Box::new(callback)),
                result: None,
            }),
        }
    }

    /// Returns the result if the node has completed.
    pub fn result(&self) -> Option<T> {
        self.inner.with(|inner| inner.result.clone())
    }

    pub fn is_complete(&self) -> bool {
        self.inner.with(|inner| inner.result.is_some())
    }

    /// Completes the node on the synchronous path.
    ///
    /// The result becomes observable immediately; the callback is not
    /// invoked, since the submitting call reports completion by returning
    /// `true`.
    pub(crate) fn complete_inline(&self, value: T) {
        self.inner.with(|inner| {
            debug_assert!(inner.result.is_none(), "node completed twice");
            inner.result = Some(value);
        });
    }

    /// Completes the node on the asynchronous path, posting the callback
    /// (if any) to `queue`.
    ///
    /// The callback is posted rather than invoked so that completion can
    /// be triggered from under object locks without violating the lock
    /// order.
    pub(crate) fn complete(&self, queue: &Arc<dyn WorkQueue>, value: T) {
        let callback = self.inner.with(|inner| {
            debug_assert!(inner.result.is_none(), "node completed twice");
            inner.result = Some(value.clone());
            inner.callback.take()
        });

        if let Some(callback) = callback {
            queue.post(Box::new(move || callback(value)));
        }
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}
