//! Submission/completion ring abstraction.
//!
//! A `WriteRing` is the asynchronous execution context the engine drives:
//! queue vectored writes, kick them to the device in one batch, then peek
//! for completions without blocking.
//!
//! # Implementors
//!
//! - `UringRing` (diow-module, Linux): io_uring with optional SQPOLL,
//!   IOPOLL and registered files.
//!
//! - `MemRing` (diow-module): in-memory device with the same alignment
//!   rules as `O_DIRECT`. Completes out of order, can stall and inject
//!   errors. Used by tests and dry runs.

use std::os::fd::RawFd;

use crate::error::Result;
use crate::job::Target;
use crate::segment::SegmentArray;
use crate::token::Token;

/// A finished request as reported by the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCompletion {
    /// Token attached at submission.
    pub token: Token,
    /// Bytes written, or negative errno.
    pub result: i32,
    /// Backend-specific flags.
    pub flags: u32,
}

/// Async vectored-write submission and completion.
///
/// The engine calls `push_writev()` for each request, `submit()` once per
/// batch, then `peek_completion()` / `acknowledge()` until nothing is
/// ready.
///
/// **Contract:** `push_writev()`, `submit()` and `peek_completion()` must
/// never block. Only `wait_completion()` may.
pub trait WriteRing {
    /// Queue one vectored write of `segments` at file `offset`.
    ///
    /// Returns `Err(RingFull)` if there is no free submission entry.
    ///
    /// # Safety
    ///
    /// The iovec array in `segments` and the memory it points to must stay
    /// valid and unmoved until the completion carrying `token` has been
    /// acknowledged.
    unsafe fn push_writev(
        &mut self,
        target: Target,
        segments: &SegmentArray,
        offset: u64,
        token: Token,
    ) -> Result<()>;

    /// Hand every queued write to the device. Returns how many were taken.
    fn submit(&mut self) -> Result<usize>;

    /// Look at the oldest ready completion without consuming it.
    ///
    /// Peeking again before `acknowledge()` returns the same completion.
    /// `None` means nothing is ready yet, which is not an error.
    fn peek_completion(&mut self) -> Option<RingCompletion>;

    /// Mark the completion returned by the last peek as consumed.
    fn acknowledge(&mut self, completion: &RingCompletion);

    /// Block until at least one completion is ready.
    fn wait_completion(&mut self) -> Result<()>;

    /// Submission queue entries.
    fn depth(&self) -> u32;

    /// Install `fds` as the fixed file table, so `Target::Fixed(i)` refers
    /// to `fds[i]`. Rings without a file table accept and ignore it.
    fn register_files(&mut self, fds: &[RawFd]) -> Result<()> {
        let _ = fds;
        Ok(())
    }
}
