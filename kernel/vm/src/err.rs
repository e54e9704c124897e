use core::fmt;

/// Error kinds surfaced at the completion of top-level operations.
///
/// Errors inside asynchronous chains short-circuit the chain and complete
/// the top-level node with the first error encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A caller-provided region or backing window is too small.
    BufferTooSmall,
    /// A virtual address is unaligned, out of bounds, or not covered by
    /// any mapping or view.
    BadAddress,
    /// The physical or virtual allocator is exhausted.
    OutOfMemory,
    /// The faulting access is incompatible with the mapping's protection.
    AccessDenied,
    /// An internal contract was violated (e.g. a pager-side fetch of a
    /// page it never loaded).
    Fault,
    /// The user-space pager backing a managed range is unreachable.
    PagerGone,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::BufferTooSmall => "buffer too small",
            Error::BadAddress => "bad address",
            Error::OutOfMemory => "out of memory",
            Error::AccessDenied => "access denied",
            Error::Fault => "internal fault",
            Error::PagerGone => "pager gone",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
