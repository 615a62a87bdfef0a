//! io_uring `WriteRing` implementation.
//!
//! Wraps the `io-uring` crate. The engine calls:
//! 1. `push_writev()` per request (queues an `IORING_OP_WRITEV` SQE)
//! 2. `submit()` once per batch (`io_uring_enter`, or a wakeup in SQPOLL mode)
//! 3. `peek_completion()` / `acknowledge()` to drain CQEs
//!
//! With `IORING_SETUP_IOPOLL` and no SQ thread, completions are only
//! reaped from inside `io_uring_enter`, so an empty peek enters the
//! kernel once with `GETEVENTS` before reporting nothing ready.

use std::os::unix::io::RawFd;

use diow_core::env::{env_get, env_get_bool};
use diow_core::error::{DiowError, Result};
use diow_core::job::Target;
use diow_core::ring::{RingCompletion, WriteRing};
use diow_core::segment::SegmentArray;
use diow_core::token::Token;

use io_uring::{opcode, types, IoUring};
use tracing::{debug, info};

fn errno_of(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Configuration for UringRing.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Number of SQ entries. Must be power of 2.
    pub sq_entries: u32,
    /// Number of CQ entries. Defaults to 2 * sq_entries.
    pub cq_entries: Option<u32>,
    /// Kernel thread polls the SQ (`IORING_SETUP_SQPOLL`).
    pub sqpoll: bool,
    /// Busy-poll for I/O completions (`IORING_SETUP_IOPOLL`). Needs
    /// `O_DIRECT` files on a device that supports polling.
    pub iopoll: bool,
    /// SQ thread idle time before it sleeps, in milliseconds.
    pub sq_thread_idle_ms: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RingConfig {
    /// Plain ring: 64 entries, no SQPOLL, no IOPOLL.
    pub fn new() -> Self {
        Self {
            sq_entries: 64,
            cq_entries: None,
            sqpoll: false,
            iopoll: false,
            sq_thread_idle_ms: 5000,
        }
    }

    /// Environment variables (all optional):
    /// - `DIOW_QUEUE_DEPTH` - SQ entries (default 64)
    /// - `DIOW_SQPOLL` - SQ thread polling (default on)
    /// - `DIOW_IOPOLL` - completion polling (default on)
    /// - `DIOW_SQ_IDLE_MS` - SQ thread idle (default 5000)
    pub fn from_env() -> Self {
        Self {
            sq_entries: env_get("DIOW_QUEUE_DEPTH", 64),
            cq_entries: None,
            sqpoll: env_get_bool("DIOW_SQPOLL", true),
            iopoll: env_get_bool("DIOW_IOPOLL", true),
            sq_thread_idle_ms: env_get("DIOW_SQ_IDLE_MS", 5000),
        }
    }

    pub fn sq_entries(mut self, n: u32) -> Self {
        self.sq_entries = n;
        self
    }

    pub fn sqpoll(mut self, enable: bool) -> Self {
        self.sqpoll = enable;
        self
    }

    pub fn iopoll(mut self, enable: bool) -> Self {
        self.iopoll = enable;
        self
    }

    pub fn sq_thread_idle_ms(mut self, ms: u32) -> Self {
        self.sq_thread_idle_ms = ms;
        self
    }
}

/// io_uring-backed ring.
pub struct UringRing {
    ring: IoUring,
    sqpoll: bool,
    iopoll: bool,
    peeked: Option<RingCompletion>,
    pending_submit: u32,
}

impl UringRing {
    pub fn new(config: RingConfig) -> Result<Self> {
        let mut builder = IoUring::builder();
        if config.sqpoll {
            builder.setup_sqpoll(config.sq_thread_idle_ms);
        }
        if config.iopoll {
            builder.setup_iopoll();
        }
        if let Some(cq) = config.cq_entries {
            builder.setup_cqsize(cq);
        }
        let ring = builder
            .build(config.sq_entries)
            .map_err(|e| DiowError::RingSetup(errno_of(&e)))?;

        info!(
            sq_entries = ring.params().sq_entries(),
            cq_entries = ring.params().cq_entries(),
            sqpoll = config.sqpoll,
            iopoll = config.iopoll,
            "io_uring ready"
        );

        Ok(Self {
            ring,
            sqpoll: config.sqpoll,
            iopoll: config.iopoll,
            peeked: None,
            pending_submit: 0,
        })
    }

    /// Drop the fixed file table installed by `register_files`.
    pub fn unregister_files(&mut self) -> Result<()> {
        self.ring
            .submitter()
            .unregister_files()
            .map_err(|e| DiowError::Register(errno_of(&e)))
    }

    fn pop_cqe(&mut self) -> Option<RingCompletion> {
        self.ring.completion().next().map(|cqe| RingCompletion {
            token: Token(cqe.user_data()),
            result: cqe.result(),
            flags: cqe.flags(),
        })
    }
}

impl WriteRing for UringRing {
    unsafe fn push_writev(
        &mut self,
        target: Target,
        segments: &SegmentArray,
        offset: u64,
        token: Token,
    ) -> Result<()> {
        let sqe = match target {
            Target::Fixed(index) => {
                opcode::Writev::new(types::Fixed(index), segments.as_ptr(), segments.iovcnt())
            }
            Target::Fd(fd) => {
                opcode::Writev::new(types::Fd(fd), segments.as_ptr(), segments.iovcnt())
            }
        }
        .offset(offset)
        .build()
        .user_data(token.0);

        // Safety: the caller keeps the iovecs and the buffer alive until
        // this token's completion is acknowledged.
        self.ring
            .submission()
            .push(&sqe)
            .map_err(|_| DiowError::RingFull)?;
        self.pending_submit += 1;
        Ok(())
    }

    fn submit(&mut self) -> Result<usize> {
        if self.pending_submit == 0 {
            return Ok(0);
        }
        let submitted = self
            .ring
            .submit()
            .map_err(|e| DiowError::Submit(errno_of(&e)))?;
        // In SQPOLL mode the count only covers entries the SQ thread had
        // already picked up; the rest are still in the shared ring.
        self.pending_submit = 0;
        Ok(submitted)
    }

    fn peek_completion(&mut self) -> Option<RingCompletion> {
        if self.peeked.is_none() {
            self.peeked = self.pop_cqe();
        }
        if self.peeked.is_none() && self.iopoll && !self.sqpoll {
            // Reap polled completions without waiting for any.
            if self.ring.submit_and_wait(0).is_ok() {
                self.peeked = self.pop_cqe();
            }
        }
        self.peeked
    }

    fn acknowledge(&mut self, completion: &RingCompletion) {
        if self.peeked.as_ref() == Some(completion) {
            self.peeked = None;
        }
    }

    fn wait_completion(&mut self) -> Result<()> {
        if self.peeked.is_some() || !self.ring.completion().is_empty() {
            return Ok(());
        }
        self.ring
            .submit_and_wait(1)
            .map_err(|e| DiowError::Submit(errno_of(&e)))?;
        Ok(())
    }

    fn depth(&self) -> u32 {
        self.ring.params().sq_entries()
    }

    fn register_files(&mut self, fds: &[RawFd]) -> Result<()> {
        self.ring
            .submitter()
            .register_files(fds)
            .map_err(|e| DiowError::Register(errno_of(&e)))?;
        debug!(count = fds.len(), "registered files");
        Ok(())
    }
}
