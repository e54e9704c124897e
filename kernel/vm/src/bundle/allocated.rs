use alloc::sync::Arc;
use alloc::vec::Vec;

use num_utils::{div_ceil, is_aligned};

use crate::bundle::{FetchNode, MemoryBundle};
use crate::err::{Error, Result};
use crate::phys::VmContext;
use crate::sync::SpinLock;
use crate::types::{PhysAddr, PhysRange, PAGE_SIZE};

struct AllocatedState {
    /// One entry per chunk; `None` until first fetched.
    chunks: Vec<Option<PhysAddr>>,
}

/// Anonymous memory, allocated lazily in physically contiguous chunks.
///
/// A chunk is allocated and zero-filled the first time any offset inside
/// it is fetched; until then the chunk slot is empty and `peek` returns
/// nothing. Grows on `resize`; never shrinks.
pub struct AllocatedMemory {
    ctx: Arc<VmContext>,
    chunk_size: usize,
    chunk_align: usize,
    state: SpinLock<AllocatedState>,
}

impl AllocatedMemory {
    /// Creates a bundle of `length` bytes carved into `chunk_size`-byte
    /// chunks aligned to `chunk_align`.
    ///
    /// `length` is rounded up to a whole number of chunks.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is not a page-aligned power of two or if
    /// `chunk_align` is zero.
    pub fn new(
        ctx: Arc<VmContext>,
        length: usize,
        chunk_size: usize,
        chunk_align: usize,
    ) -> Arc<Self> {
        assert!(chunk_size.is_power_of_two() && is_aligned(chunk_size, PAGE_SIZE));
        assert!(chunk_align > 0);

        let chunk_count = div_ceil(length, chunk_size);
        let mut chunks = Vec::new();
        chunks.resize(chunk_count, None);

        Arc::new(Self {
            ctx,
            chunk_size,
            chunk_align,
            state: SpinLock::new(AllocatedState { chunks }),
        })
    }

    /// Creates a page-chunked bundle, the common configuration.
    pub fn new_paged(ctx: Arc<VmContext>, length: usize) -> Arc<Self> {
        Self::new(ctx, length, PAGE_SIZE, PAGE_SIZE)
    }

    fn chunk_for(&self, state: &mut AllocatedState, index: usize) -> Result<PhysAddr> {
        if let Some(chunk) = state.chunks[index] {
            return Ok(chunk);
        }

        let chunk = self
            .ctx
            .phys()
            .alloc_contiguous(self.chunk_size, self.chunk_align)?;
        // Safety: the chunk was just allocated and is not yet published.
        unsafe {
            self.ctx.zero_range(chunk, self.chunk_size);
        }
        state.chunks[index] = Some(chunk);
        Ok(chunk)
    }
}

impl MemoryBundle for AllocatedMemory {
    fn length(&self) -> usize {
        self.state.with(|state| state.chunks.len()) * self.chunk_size
    }

    fn peek(&self, offset: usize) -> Option<PhysAddr> {
        self.state.with(|state| {
            let chunk = state.chunks.get(offset / self.chunk_size).copied()??;
            Some(chunk + offset % self.chunk_size)
        })
    }

    fn fetch(self: Arc<Self>, offset: usize, node: &Arc<FetchNode>) -> bool {
        let result = self.state.with(|state| {
            if offset / self.chunk_size >= state.chunks.len() {
                return Err(Error::BadAddress);
            }

            let chunk = self.chunk_for(state, offset / self.chunk_size)?;
            let in_chunk = offset % self.chunk_size;
            Ok(PhysRange::new(chunk + in_chunk, self.chunk_size - in_chunk))
        });

        node.complete_inline(result);
        true
    }

    fn resize(&self, new_length: usize) -> Result<()> {
        let new_count = div_ceil(new_length, self.chunk_size);
        self.state.with(|state| {
            if new_count < state.chunks.len() {
                return Err(Error::Fault);
            }
            state.chunks.resize(new_count, None);
            Ok(())
        })
    }
}

impl Drop for AllocatedMemory {
    fn drop(&mut self) {
        for chunk in self.state.get_mut().chunks.iter().flatten() {
            // Safety: the chunk was allocated by us with `chunk_size`
            // bytes and nothing references it once the bundle is gone.
            unsafe {
                self.ctx.phys().free(*chunk, self.chunk_size);
            }
        }
    }
}
