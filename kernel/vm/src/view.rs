//! Views: windowed projections of a bundle into address-space
//! coordinates.

use alloc::sync::Arc;

use crate::bundle::MemoryBundle;
use crate::err::{Error, Result};

/// An immutable, shared window onto a bundle.
///
/// `resolve_range` translates view-relative offsets into bundle
/// coordinates; the returned bundle reference is valid for the lifetime
/// of the view.
pub trait VirtualView: Send + Sync {
    /// Length of the window in bytes.
    fn length(&self) -> usize;

    /// Resolves `(offset, size)` to `(bundle, bundle_offset,
    /// usable_size)` with `0 < usable_size <= size`.
    ///
    /// # Errors
    ///
    /// * `BadAddress` - `offset` lies outside the window.
    fn resolve_range(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<(Arc<dyn MemoryBundle>, usize, usize)>;
}

/// The standard view: a fixed window `[view_offset, view_offset +
/// view_size)` of one bundle.
pub struct ExteriorBundleView {
    bundle: Arc<dyn MemoryBundle>,
    view_offset: usize,
    view_size: usize,
}

impl ExteriorBundleView {
    /// Creates a view of `bundle` covering `view_size` bytes starting at
    /// `view_offset`.
    ///
    /// # Errors
    ///
    /// * `BadAddress` - the window does not fit within the bundle, or is
    ///   empty.
    pub fn new(
        bundle: Arc<dyn MemoryBundle>,
        view_offset: usize,
        view_size: usize,
    ) -> Result<Arc<Self>> {
        let bundle_len = bundle.length();
        if view_size == 0 || view_offset > bundle_len || view_size > bundle_len - view_offset {
            return Err(Error::BadAddress);
        }

        Ok(Arc::new(Self {
            bundle,
            view_offset,
            view_size,
        }))
    }

    /// Creates a view spanning the whole of `bundle`.
    pub fn of_bundle(bundle: Arc<dyn MemoryBundle>) -> Arc<Self> {
        let view_size = bundle.length();
        Arc::new(Self {
            bundle,
            view_offset: 0,
            view_size,
        })
    }
}

impl VirtualView for ExteriorBundleView {
    fn length(&self) -> usize {
        self.view_size
    }

    fn resolve_range(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<(Arc<dyn MemoryBundle>, usize, usize)> {
        if offset >= self.view_size {
            return Err(Error::BadAddress);
        }

        let usable = size.min(self.view_size - offset);
        Ok((Arc::clone(&self.bundle), self.view_offset + offset, usable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bundle::HardwareMemory;
    use crate::types::PhysAddr;

    #[test]
    fn windowed_resolution() {
        let hw = HardwareMemory::new(PhysAddr::new(0x1000_0000), 0x4000);
        let view = ExteriorBundleView::new(hw, 0x1000, 0x2000).unwrap();

        assert_eq!(view.length(), 0x2000);

        let (_, bundle_offset, usable) = view.resolve_range(0x800, 0x1000).unwrap();
        assert_eq!(bundle_offset, 0x1800);
        assert_eq!(usable, 0x1000);

        // Size is clamped to the window.
        let (_, bundle_offset, usable) = view.resolve_range(0x1800, 0x1000).unwrap();
        assert_eq!(bundle_offset, 0x2800);
        assert_eq!(usable, 0x800);
    }

    #[test]
    fn out_of_window_resolution() {
        let hw = HardwareMemory::new(PhysAddr::new(0x1000_0000), 0x4000);
        let view = ExteriorBundleView::new(hw, 0, 0x2000).unwrap();
        assert_eq!(
            view.resolve_range(0x2000, 0x1000).unwrap_err(),
            Error::BadAddress
        );
    }

    #[test]
    fn window_must_fit_bundle() {
        let hw = HardwareMemory::new(PhysAddr::new(0x1000_0000), 0x2000);
        assert!(ExteriorBundleView::new(hw.clone(), 0x1000, 0x2000).is_err());
        assert!(ExteriorBundleView::new(hw.clone(), 0x3000, 0x1000).is_err());
        assert!(ExteriorBundleView::new(hw, 0, 0).is_err());
    }
}
