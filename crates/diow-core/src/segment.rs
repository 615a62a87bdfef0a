//! Scatter/gather segment arrays and the descriptor packer.
//!
//! A `SegmentArray` is the `iovec` list of one vectored write. It points
//! into the caller's buffer and must stay alive until the kernel has
//! finished with the request, which is why the engine parks it in the
//! `SegmentRegistry` between submission and completion.

use std::fmt;

use crate::error::{DiowError, Result};

/// The iovec list for one request.
pub struct SegmentArray {
    base: *const u8,
    iovecs: Vec<libc::iovec>,
}

impl SegmentArray {
    /// Number of segments.
    #[inline]
    pub fn len(&self) -> usize {
        self.iovecs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.iovecs.is_empty()
    }

    /// Segment count as the kernel wants it.
    #[inline]
    pub fn iovcnt(&self) -> u32 {
        self.iovecs.len() as u32
    }

    /// Pointer to the first iovec. Valid while `self` is alive and unmoved
    /// from its heap allocation (moving the `SegmentArray` itself is fine).
    #[inline]
    pub fn as_ptr(&self) -> *const libc::iovec {
        self.iovecs.as_ptr()
    }

    /// Bytes described by all segments.
    pub fn total_bytes(&self) -> usize {
        self.iovecs.iter().map(|iov| iov.iov_len).sum()
    }

    /// Address the first segment starts at.
    pub fn first_addr(&self) -> *const u8 {
        self.iovecs
            .first()
            .map_or(self.base, |iov| iov.iov_base as *const u8)
    }

    /// `(offset from buffer base, length)` of segment `i`.
    pub fn segment(&self, i: usize) -> Option<(usize, usize)> {
        self.iovecs
            .get(i)
            .map(|iov| (iov.iov_base as usize - self.base as usize, iov.iov_len))
    }

    /// All segments as `(offset, length)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.len()).filter_map(move |i| self.segment(i))
    }

    /// Raw iovecs, for backends that copy instead of handing them to a kernel.
    #[inline]
    pub fn iovecs(&self) -> &[libc::iovec] {
        &self.iovecs
    }
}

impl PartialEq for SegmentArray {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
            && self.iovecs.len() == other.iovecs.len()
            && self
                .iovecs
                .iter()
                .zip(&other.iovecs)
                .all(|(a, b)| a.iov_base == b.iov_base && a.iov_len == b.iov_len)
    }
}

impl Eq for SegmentArray {}

impl fmt::Debug for SegmentArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentArray")
            .field("base", &self.base)
            .field("segments", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

/// Split `buffer[byte_offset..byte_offset + byte_count]` into segments of
/// `block_size` bytes, the last one taking the remainder.
///
/// Fails with `ChunkTooLarge` if the range needs more than `max_segments`
/// segments.
pub fn try_pack(
    buffer: &[u8],
    byte_offset: usize,
    byte_count: usize,
    block_size: usize,
    max_segments: usize,
) -> Result<SegmentArray> {
    if block_size == 0 {
        return Err(DiowError::InvalidConfig("block size must be non-zero"));
    }
    let max = block_size.saturating_mul(max_segments);
    if byte_count > max {
        return Err(DiowError::ChunkTooLarge {
            requested: byte_count,
            max,
        });
    }
    let end = byte_offset
        .checked_add(byte_count)
        .filter(|&end| end <= buffer.len())
        .ok_or(DiowError::InvalidJob("segment range exceeds buffer"))?;

    let mut iovecs = Vec::with_capacity(byte_count.div_ceil(block_size));
    let mut pos = byte_offset;
    while pos < end {
        let len = (end - pos).min(block_size);
        iovecs.push(libc::iovec {
            iov_base: buffer[pos..pos + len].as_ptr() as *mut libc::c_void,
            iov_len: len,
        });
        pos += len;
    }

    Ok(SegmentArray {
        base: buffer.as_ptr(),
        iovecs,
    })
}

/// Fatal form of [`try_pack`] used on the submission path.
///
/// A chunk that does not fit is a sizing bug in the caller, so this
/// panics with a diagnostic instead of truncating.
pub fn pack(
    buffer: &[u8],
    byte_offset: usize,
    byte_count: usize,
    block_size: usize,
    max_segments: usize,
) -> SegmentArray {
    match try_pack(buffer, byte_offset, byte_count, block_size, max_segments) {
        Ok(segments) => segments,
        Err(e) => panic!("FATAL: {e}"),
    }
}
