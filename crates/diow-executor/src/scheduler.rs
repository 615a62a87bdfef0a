//! Submission side: cuts the job into requests and queues them while the
//! ring has room.

use diow_core::error::DiowError;
use diow_core::inflight::InFlight;
use diow_core::job::WriteJob;
use diow_core::ring::WriteRing;
use diow_core::segment::pack;
use diow_core::token::SegmentRegistry;
use tracing::trace;

use crate::report::WriteReport;

/// Progress through one job's buffer.
pub(crate) struct Scheduler {
    bytes_written: usize,
    bytes_remaining: usize,
}

impl Scheduler {
    pub(crate) fn new(job: &WriteJob<'_>) -> Self {
        Self {
            bytes_written: 0,
            bytes_remaining: job.total_len(),
        }
    }

    /// All bytes have been handed to the ring.
    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.bytes_remaining == 0
    }

    /// Queue requests until the in-flight bound is reached or the buffer
    /// is exhausted. Returns how many were queued; the caller submits them
    /// as one batch.
    pub(crate) fn fill<R: WriteRing>(
        &mut self,
        job: &WriteJob<'_>,
        ring: &mut R,
        registry: &mut SegmentRegistry,
        in_flight: &mut InFlight,
        report: &mut WriteReport,
    ) -> usize {
        let mut queued = 0;

        while in_flight.has_capacity() && !self.is_done() {
            let chunk = self.bytes_remaining.min(job.max_chunk());
            let segments = pack(
                job.buffer(),
                self.bytes_written,
                chunk,
                job.block_size(),
                job.max_segments(),
            );
            let offset = job.file_offset() + self.bytes_written as u64;

            let Some((token, segments)) = registry.insert(segments) else {
                panic!(
                    "FATAL: no free segment slot with {} of {} requests in flight",
                    in_flight.count(),
                    in_flight.depth()
                );
            };

            // Safety: the segments stay parked in `registry` until the reaper
            // sees this token's completion, and the engine does not return
            // from `run` while anything is in flight, so both the iovecs and
            // the job buffer they point into outlive the request.
            match unsafe { ring.push_writev(job.target(), segments, offset, token) } {
                Ok(()) => {}
                Err(DiowError::RingFull) => panic!(
                    "FATAL: no submission queue entry available with {} of {} requests in flight",
                    in_flight.count(),
                    in_flight.depth()
                ),
                Err(e) => panic!("FATAL: queueing write at offset {offset} failed: {e}"),
            }

            trace!(
                token = token.0,
                offset,
                len = chunk,
                segments = chunk.div_ceil(job.block_size()),
                "queued write"
            );

            in_flight.acquire();
            self.bytes_written += chunk;
            self.bytes_remaining -= chunk;
            report.requests += 1;
            queued += 1;
        }

        report.peak_in_flight = report.peak_in_flight.max(in_flight.peak());
        queued
    }
}
