use alloc::sync::Arc;

use crate::bundle::{FetchNode, MemoryBundle};
use crate::err::Error;
use crate::types::{PhysAddr, PhysRange};

/// A bundle backed by a fixed contiguous physical window.
///
/// The identity map `offset → base + offset` is established at
/// construction and never changes; `peek` and `fetch` are always
/// synchronous.
pub struct HardwareMemory {
    base: PhysAddr,
    length: usize,
}

impl HardwareMemory {
    /// Creates a bundle covering `[base, base + length)`.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `length` is not page-aligned.
    pub fn new(base: PhysAddr, length: usize) -> Arc<Self> {
        assert!(base.is_page_aligned());
        assert!(num_utils::is_aligned(length, crate::types::PAGE_SIZE));

        Arc::new(Self { base, length })
    }
}

impl MemoryBundle for HardwareMemory {
    fn length(&self) -> usize {
        self.length
    }

    fn peek(&self, offset: usize) -> Option<PhysAddr> {
        (offset < self.length).then(|| self.base + offset)
    }

    fn fetch(self: Arc<Self>, offset: usize, node: &Arc<FetchNode>) -> bool {
        let result = if offset < self.length {
            Ok(PhysRange::new(self.base + offset, self.length - offset))
        } else {
            Err(Error::BadAddress)
        };

        node.complete_inline(result);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_window() {
        let hw = HardwareMemory::new(PhysAddr::new(0x8000_0000), 0x3000);
        assert_eq!(hw.length(), 0x3000);
        assert_eq!(hw.peek(0x1000), Some(PhysAddr::new(0x8000_1000)));
        assert_eq!(hw.peek(0x3000), None);

        let node = FetchNode::new();
        assert!(hw.clone().fetch(0x1234, &node));
        assert_eq!(
            node.result().unwrap().unwrap(),
            PhysRange::new(PhysAddr::new(0x8000_1234), 0x3000 - 0x1234)
        );
    }

    #[test]
    fn out_of_range_fetch_fails() {
        let hw = HardwareMemory::new(PhysAddr::new(0x8000_0000), 0x1000);
        let node = FetchNode::new();
        assert!(hw.clone().fetch(0x1000, &node));
        assert_eq!(node.result().unwrap(), Err(Error::BadAddress));
    }

    #[test]
    fn resize_rejected() {
        let hw = HardwareMemory::new(PhysAddr::new(0x8000_0000), 0x1000);
        assert_eq!(hw.resize(0x2000), Err(Error::Fault));
    }
}
