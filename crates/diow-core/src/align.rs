//! Direct-I/O alignment policy.
//!
//! `O_DIRECT` writes bypass the page cache, so the kernel DMAs straight
//! out of the caller's memory. The buffer address must be aligned to the
//! device's memory alignment, and lengths and file offsets to its logical
//! block size. A request that breaks either rule fails with `EINVAL`.
//!
//! The policy is applied before the write loop starts: `AlignedBuf`
//! produces memory that satisfies it, and `check_job` reports a job that
//! does not.

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::config::EngineConfig;
use crate::error::{DiowError, Result};
use crate::job::WriteJob;

/// Alignment rules a job has to satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentPolicy {
    /// Buffer base address alignment.
    pub mem_align: usize,
    /// Length and file offset alignment.
    pub block_size: usize,
}

impl AlignmentPolicy {
    pub fn new(mem_align: usize, block_size: usize) -> Self {
        Self {
            mem_align,
            block_size,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.mem_align, config.block_size)
    }

    pub fn check_buffer(&self, buf: &[u8]) -> Result<()> {
        let addr = buf.as_ptr() as usize;
        if addr % self.mem_align != 0 {
            return Err(DiowError::Misaligned {
                what: "buffer address",
                value: addr as u64,
                align: self.mem_align,
            });
        }
        Ok(())
    }

    pub fn check_len(&self, len: usize) -> Result<()> {
        if len % self.block_size != 0 {
            return Err(DiowError::Misaligned {
                what: "length",
                value: len as u64,
                align: self.block_size,
            });
        }
        Ok(())
    }

    pub fn check_offset(&self, offset: u64) -> Result<()> {
        if offset % self.block_size as u64 != 0 {
            return Err(DiowError::Misaligned {
                what: "file offset",
                value: offset,
                align: self.block_size,
            });
        }
        Ok(())
    }

    /// Every request of `job` will satisfy the policy iff this passes.
    pub fn check_job(&self, job: &WriteJob<'_>) -> Result<()> {
        self.check_buffer(job.buffer())?;
        self.check_len(job.total_len())?;
        self.check_offset(job.file_offset())?;
        // Requests start at multiples of the job's chunk, so a chunk that
        // is not block aligned would misalign every request after the first.
        self.check_len(job.max_chunk())
    }

    /// Allocate a zeroed buffer of `len` bytes that satisfies the policy.
    pub fn allocate(&self, len: usize) -> Result<AlignedBuf> {
        self.check_len(len)?;
        AlignedBuf::new(len, self.mem_align)
    }
}

/// Heap buffer with a chosen base alignment.
///
/// `with_skew` shifts the usable region off the alignment boundary, to
/// reproduce what happens when an unaligned buffer reaches `O_DIRECT`.
pub struct AlignedBuf {
    base: NonNull<u8>,
    layout: Layout,
    skew: usize,
    len: usize,
}

// Safety: AlignedBuf uniquely owns its allocation.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Zeroed buffer of `len` bytes whose address is a multiple of `align`.
    pub fn new(len: usize, align: usize) -> Result<Self> {
        Self::with_skew(len, align, 0)
    }

    /// Zeroed buffer of `len` bytes starting `skew` bytes past an
    /// `align` boundary.
    pub fn with_skew(len: usize, align: usize, skew: usize) -> Result<Self> {
        let size = len
            .checked_add(skew)
            .ok_or(DiowError::InvalidConfig("buffer size overflows"))?
            .max(1);
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| DiowError::InvalidConfig("alignment must be a power of two"))?;
        // Safety: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(DiowError::Os(libc::ENOMEM))?;
        Ok(Self {
            base,
            layout,
            skew,
            len,
        })
    }

    /// Alignment the allocation was made with.
    #[inline]
    pub fn align(&self) -> usize {
        self.layout.align()
    }

    /// True if the usable region starts on a multiple of `align`.
    #[inline]
    pub fn is_aligned_to(&self, align: usize) -> bool {
        (self.as_ptr() as usize) % align == 0
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: base..base+skew+len lies inside the allocation.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(self.skew), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(self.skew), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // Safety: allocated in with_skew with this exact layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .field("skew", &self.skew)
            .finish()
    }
}
