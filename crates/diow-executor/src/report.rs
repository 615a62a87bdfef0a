//! Outcome of one write.

use diow_core::error::{strerror, DiowError, Result};
use diow_core::ring::RingCompletion;
use tracing::{trace, warn};

/// Why a request did not write everything it carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The completion carried `-errno`.
    Errno(i32),
    /// The request completed but wrote fewer bytes than it described.
    Short { written: usize },
}

impl FailureKind {
    /// errno to report for this failure. Short writes count as `EIO`.
    pub fn errno(&self) -> i32 {
        match *self {
            FailureKind::Errno(errno) => errno,
            FailureKind::Short { .. } => libc::EIO,
        }
    }
}

/// One request that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    /// File offset the request started at.
    pub file_offset: u64,
    /// Bytes the request described.
    pub len: usize,
    pub kind: FailureKind,
}

/// Counters and failures gathered while running one `WriteJob`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Length of the job's buffer.
    pub bytes_requested: usize,
    /// Sum of positive completion results.
    pub bytes_written: usize,
    /// Requests queued on the ring.
    pub requests: usize,
    /// Completions reaped.
    pub completions: usize,
    /// Successful batched submits.
    pub batches: usize,
    /// Submits retried after a transient error.
    pub submit_retries: usize,
    /// Highest number of requests in flight at once.
    pub peak_in_flight: u32,
    pub failures: Vec<RequestFailure>,
    file_offset: u64,
}

impl WriteReport {
    pub(crate) fn new(bytes_requested: usize, file_offset: u64) -> Self {
        Self {
            bytes_requested,
            file_offset,
            ..Self::default()
        }
    }

    /// Every request completed and wrote all of its bytes.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
            && self.completions == self.requests
            && self.bytes_written == self.bytes_requested
    }

    /// errno of the first failure, if any.
    pub fn first_errno(&self) -> Option<i32> {
        self.failures.first().map(|f| f.kind.errno())
    }

    /// `Ok(self)` when the write fully succeeded, `RequestsFailed` otherwise.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(DiowError::RequestsFailed {
            failed: self.failures.len(),
            first_errno: self.first_errno().unwrap_or(libc::EIO),
        })
    }

    /// Account for one reaped completion. `buf_offset` is where the
    /// request's first segment sits in the job buffer, `requested` how many
    /// bytes it described.
    pub(crate) fn record(&mut self, completion: &RingCompletion, buf_offset: usize, requested: usize) {
        self.completions += 1;
        let file_offset = self.file_offset + buf_offset as u64;

        if completion.result < 0 {
            let errno = -completion.result;
            warn!(
                file_offset,
                len = requested,
                errno,
                error = %strerror(errno),
                "write request failed"
            );
            self.failures.push(RequestFailure {
                file_offset,
                len: requested,
                kind: FailureKind::Errno(errno),
            });
            return;
        }

        let written = completion.result as usize;
        self.bytes_written += written;
        if written < requested {
            warn!(file_offset, len = requested, written, "short write");
            self.failures.push(RequestFailure {
                file_offset,
                len: requested,
                kind: FailureKind::Short { written },
            });
        } else {
            trace!(file_offset, written, token = completion.token.0, "write request done");
        }
    }
}
