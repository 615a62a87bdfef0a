//! In-memory `WriteRing` implementation.
//!
//! Behaves like an io_uring in front of an `O_DIRECT` file, minus the
//! kernel:
//!
//! - `push_writev` queues into a bounded SQ (`depth` entries).
//! - `submit` moves queued requests to the device.
//! - The device retires up to `batch` requests per tick, reading the data
//!   through the request's iovecs at that point, and posts their
//!   completions in reverse order so the reaper sees them out of order.
//! - An iovec address off the DMA alignment, or a length or file offset
//!   off the logical block size, completes with `-EINVAL`, as the kernel
//!   does for `O_DIRECT`. Both default to 512 bytes.
//!
//! Faults can be injected per request (errno or short write), a submit can
//! be failed once, and `stall_every` makes every Nth peek report nothing
//! even though work is pending.

use std::collections::{HashMap, VecDeque};

use crossbeam_queue::ArrayQueue;
use tracing::trace;

use diow_core::error::{DiowError, Result};
use diow_core::job::Target;
use diow_core::ring::{RingCompletion, WriteRing};
use diow_core::segment::SegmentArray;
use diow_core::token::Token;

/// Injected outcome for one request, keyed by submission sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Complete with `-errno` and write nothing.
    Errno(i32),
    /// Write and report only this many bytes.
    Short(usize),
}

/// A request as the device saw it at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub seq: u64,
    pub target: Target,
    pub offset: u64,
    pub iovcnt: u32,
    pub bytes: usize,
}

struct Request {
    seq: u64,
    token: Token,
    offset: u64,
    iov: *const libc::iovec,
    iovcnt: u32,
}

/// In-memory ring and device.
pub struct MemRing {
    depth: u32,
    mem_align: usize,
    block_align: usize,
    batch: usize,
    stall_every: u64,

    queued: Vec<Request>,
    device: VecDeque<Request>,
    cq: ArrayQueue<RingCompletion>,
    peeked: Option<RingCompletion>,

    faults: HashMap<u64, Fault>,
    fail_next_submit: Option<i32>,

    file: Vec<u8>,
    requests: Vec<RequestRecord>,
    next_seq: u64,
    peeks: u64,
    submit_calls: u64,
    outstanding: u32,
    peak_outstanding: u32,
}

impl MemRing {
    /// Ring with `depth` SQ entries, 512-byte DMA alignment and 512-byte
    /// logical blocks.
    pub fn new(depth: u32) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            mem_align: 512,
            block_align: 512,
            batch: depth as usize,
            stall_every: 0,
            queued: Vec::with_capacity(depth as usize),
            device: VecDeque::new(),
            cq: ArrayQueue::new(2 * depth as usize),
            peeked: None,
            faults: HashMap::new(),
            fail_next_submit: None,
            file: Vec::new(),
            requests: Vec::new(),
            next_seq: 0,
            peeks: 0,
            submit_calls: 0,
            outstanding: 0,
            peak_outstanding: 0,
        }
    }

    /// Alignment rules the device enforces: `mem_align` for every iovec
    /// address, `block_align` for lengths and file offsets.
    pub fn alignment(mut self, mem_align: usize, block_align: usize) -> Self {
        self.mem_align = mem_align.max(1);
        self.block_align = block_align.max(1);
        self
    }

    /// Requests retired per device tick.
    pub fn batch(mut self, n: usize) -> Self {
        self.batch = n.max(1);
        self
    }

    /// Every `n`th peek reports nothing ready. Zero disables stalls.
    pub fn stall_every(mut self, n: u64) -> Self {
        self.stall_every = n;
        self
    }

    /// Inject `fault` into the request with submission sequence `seq`.
    pub fn inject(mut self, seq: u64, fault: Fault) -> Self {
        self.faults.insert(seq, fault);
        self
    }

    /// Make the next `submit()` fail with `errno` without taking anything.
    pub fn fail_next_submit(&mut self, errno: i32) {
        self.fail_next_submit = Some(errno);
    }

    /// What has been written so far.
    pub fn contents(&self) -> &[u8] {
        &self.file
    }

    /// Every request in submission order.
    pub fn requests(&self) -> &[RequestRecord] {
        &self.requests
    }

    /// Submitted requests whose completion has not been acknowledged.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Highest `outstanding` ever reached.
    pub fn peak_outstanding(&self) -> u32 {
        self.peak_outstanding
    }

    /// Number of `submit()` calls that handed work to the device.
    pub fn submit_calls(&self) -> u64 {
        self.submit_calls
    }

    fn misaligned(&self, req: &Request) -> bool {
        if req.offset % self.block_align as u64 != 0 {
            return true;
        }
        // Safety: push_writev's contract keeps the iovecs alive until the
        // completion is acknowledged, which is after retire.
        let iovs = unsafe { std::slice::from_raw_parts(req.iov, req.iovcnt as usize) };
        iovs.iter().any(|iov| {
            (iov.iov_base as usize) % self.mem_align != 0 || iov.iov_len % self.block_align != 0
        })
    }

    fn write_at(&mut self, offset: u64, iov: *const libc::iovec, iovcnt: u32, limit: usize) -> usize {
        // Safety: see `misaligned`; the iovec bases point into the
        // caller's borrowed buffer.
        let iovs = unsafe { std::slice::from_raw_parts(iov, iovcnt as usize) };
        let mut pos = offset as usize;
        let mut written = 0;
        for iov in iovs {
            let len = iov.iov_len.min(limit - written);
            if len == 0 {
                break;
            }
            let src = unsafe { std::slice::from_raw_parts(iov.iov_base as *const u8, len) };
            if self.file.len() < pos + len {
                self.file.resize(pos + len, 0);
            }
            self.file[pos..pos + len].copy_from_slice(src);
            pos += len;
            written += len;
        }
        written
    }

    fn retire(&mut self, req: Request) -> RingCompletion {
        let requested = self
            .requests
            .get(req.seq as usize)
            .map_or(0, |r| r.bytes);
        let fault = self.faults.get(&req.seq).copied();
        let result = match fault {
            Some(Fault::Errno(errno)) => -errno.abs(),
            _ if self.misaligned(&req) => -libc::EINVAL,
            Some(Fault::Short(n)) => self.write_at(req.offset, req.iov, req.iovcnt, n.min(requested)) as i32,
            None => self.write_at(req.offset, req.iov, req.iovcnt, requested) as i32,
        };
        trace!(seq = req.seq, token = req.token.0, result, "mem ring retired request");
        RingCompletion {
            token: req.token,
            result,
            flags: 0,
        }
    }

    /// Move up to `batch` requests from the device to the CQ, newest first.
    fn tick(&mut self) {
        let room = self.cq.capacity() - self.cq.len();
        let n = self.batch.min(room).min(self.device.len());
        let done: Vec<Request> = self.device.drain(..n).collect();
        for req in done.into_iter().rev() {
            let completion = self.retire(req);
            // Room was checked above.
            let _ = self.cq.push(completion);
        }
    }
}

impl WriteRing for MemRing {
    unsafe fn push_writev(
        &mut self,
        target: Target,
        segments: &SegmentArray,
        offset: u64,
        token: Token,
    ) -> Result<()> {
        if self.queued.len() >= self.depth as usize {
            return Err(DiowError::RingFull);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.requests.push(RequestRecord {
            seq,
            target,
            offset,
            iovcnt: segments.iovcnt(),
            bytes: segments.total_bytes(),
        });
        self.queued.push(Request {
            seq,
            token,
            offset,
            iov: segments.as_ptr(),
            iovcnt: segments.iovcnt(),
        });
        Ok(())
    }

    fn submit(&mut self) -> Result<usize> {
        if let Some(errno) = self.fail_next_submit.take() {
            return Err(DiowError::Submit(errno));
        }
        let n = self.queued.len();
        if n > 0 {
            self.submit_calls += 1;
            self.outstanding += n as u32;
            self.peak_outstanding = self.peak_outstanding.max(self.outstanding);
            self.device.extend(self.queued.drain(..));
        }
        Ok(n)
    }

    fn peek_completion(&mut self) -> Option<RingCompletion> {
        if self.peeked.is_none() {
            self.peeks += 1;
            if self.stall_every > 0 && self.peeks % self.stall_every == 0 {
                return None;
            }
            if self.cq.is_empty() {
                self.tick();
            }
            self.peeked = self.cq.pop();
        }
        self.peeked
    }

    fn acknowledge(&mut self, completion: &RingCompletion) {
        if self.peeked.as_ref() == Some(completion) {
            self.peeked = None;
            self.outstanding -= 1;
        }
    }

    fn wait_completion(&mut self) -> Result<()> {
        if self.peeked.is_some() || !self.cq.is_empty() {
            return Ok(());
        }
        if self.device.is_empty() {
            // Nothing submitted would ever complete.
            return Err(DiowError::Os(libc::EDEADLK));
        }
        self.tick();
        Ok(())
    }

    fn depth(&self) -> u32 {
        self.depth
    }
}
