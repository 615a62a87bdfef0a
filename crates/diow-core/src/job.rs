//! Write job description.

use std::os::fd::RawFd;

use crate::config::EngineConfig;
use crate::error::{DiowError, Result};
use crate::UIO_MAXIOV;

/// Where the bytes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Index into the ring's registered file table.
    Fixed(u32),
    /// Plain file descriptor.
    Fd(RawFd),
}

/// One buffer to be written at `file_offset`, split into requests of at
/// most `block_size * max_segments` bytes.
///
/// The buffer is borrowed for the whole write; the engine never keeps a
/// reference past `run`.
#[derive(Debug, Clone, Copy)]
pub struct WriteJob<'a> {
    buffer: &'a [u8],
    target: Target,
    file_offset: u64,
    block_size: usize,
    max_segments: usize,
}

impl<'a> WriteJob<'a> {
    pub fn new(
        buffer: &'a [u8],
        target: Target,
        file_offset: u64,
        block_size: usize,
        max_segments: usize,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(DiowError::InvalidJob("block size must be non-zero"));
        }
        if max_segments == 0 || max_segments > UIO_MAXIOV {
            return Err(DiowError::InvalidJob("max segments must be in 1..=1024"));
        }
        if buffer.is_empty() {
            return Err(DiowError::InvalidJob("buffer is empty"));
        }
        if buffer.len() % block_size != 0 {
            return Err(DiowError::InvalidJob(
                "buffer length is not a multiple of the block size",
            ));
        }
        if file_offset.checked_add(buffer.len() as u64).is_none() {
            return Err(DiowError::InvalidJob("file offset overflows"));
        }
        Ok(Self {
            buffer,
            target,
            file_offset,
            block_size,
            max_segments,
        })
    }

    /// Job using the block size and segment limit from `config`.
    pub fn with_config(
        buffer: &'a [u8],
        target: Target,
        file_offset: u64,
        config: &EngineConfig,
    ) -> Result<Self> {
        Self::new(buffer, target, file_offset, config.block_size, config.max_segments)
    }

    #[inline]
    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    #[inline]
    pub fn target(&self) -> Target {
        self.target
    }

    #[inline]
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Upper bound on bytes carried by one request.
    #[inline]
    pub fn max_chunk(&self) -> usize {
        self.block_size * self.max_segments
    }

    /// Number of requests a full write issues.
    pub fn request_count(&self) -> usize {
        self.total_len().div_ceil(self.max_chunk())
    }
}
