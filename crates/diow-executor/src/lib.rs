//! # diow-executor — The Write Engine
//!
//! Writes one buffer to one target through a `WriteRing`, keeping up to
//! `queue_depth` vectored writes in flight. It runs on the caller's thread:
//!
//! ```text
//! loop {
//!     1. FILLING: while in flight < depth and bytes remain
//!          chunk = min(remaining, block_size * max_segments)
//!          pack chunk into a SegmentArray, park it under a Token
//!          queue a writev for it
//!     2. Submit everything queued in one call
//!     3. DRAINING: while a completion is ready
//!          release the token's segments, record the result
//!          acknowledge, in flight -= 1
//!     4. DONE when no bytes remain and nothing is in flight
//!     5. No progress? pause according to the DrainMode
//! }
//! ```
//!
//! Per-request failures do not stop the write; they end up in the
//! `WriteReport`. Broken bookkeeping (a chunk that does not fit, a full
//! submission queue, a completion for a token nobody issued) panics with
//! a `FATAL:` message.

mod idle;
mod reaper;
pub mod report;
mod scheduler;

use diow_core::align::AlignmentPolicy;
use diow_core::config::EngineConfig;
use diow_core::error::{DiowError, Result};
use diow_core::inflight::InFlight;
use diow_core::job::WriteJob;
use diow_core::ring::WriteRing;
use diow_core::token::SegmentRegistry;
use tracing::{debug, error, info, warn};

pub use report::{FailureKind, RequestFailure, WriteReport};

use idle::Idle;
use scheduler::Scheduler;

/// Drives writes through a borrowed ring.
pub struct WriteEngine<'r, R: WriteRing> {
    ring: &'r mut R,
    config: EngineConfig,
    depth: u32,
    registry: SegmentRegistry,
}

impl<'r, R: WriteRing> WriteEngine<'r, R> {
    /// The effective queue depth is the smaller of `config.queue_depth`
    /// and what the ring can hold.
    pub fn new(ring: &'r mut R, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let depth = config.queue_depth.min(ring.depth());
        if depth == 0 {
            return Err(DiowError::InvalidConfig("ring has no submission entries"));
        }
        if depth < config.queue_depth {
            debug!(
                configured = config.queue_depth,
                ring = ring.depth(),
                "queue depth limited by ring size"
            );
        }
        Ok(Self {
            ring,
            config,
            depth,
            registry: SegmentRegistry::with_capacity(depth as usize),
        })
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Segment arrays handed out and taken back, across every run.
    #[inline]
    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    /// Write `job` to completion and report what happened.
    ///
    /// Returns `Err` only when nothing was issued. Once requests are in
    /// flight this only returns after every one has been reaped; failed
    /// requests are listed in the report.
    pub fn run(&mut self, job: &WriteJob<'_>) -> Result<WriteReport> {
        let policy = AlignmentPolicy::new(self.config.mem_align, job.block_size());
        if let Err(e) = policy.check_job(job) {
            warn!(error = %e, "job does not meet direct I/O alignment; requests will likely fail");
        }

        info!(
            bytes = job.total_len(),
            file_offset = job.file_offset(),
            requests = job.request_count(),
            max_chunk = job.max_chunk(),
            depth = self.depth,
            "write started"
        );

        let mut scheduler = Scheduler::new(job);
        let mut in_flight = InFlight::new(self.depth);
        let mut report = WriteReport::new(job.total_len(), job.file_offset());
        let mut idle = Idle::new(self.config.drain_mode);

        loop {
            // ── Step 1: Fill the ring up to depth ──
            let queued = scheduler.fill(
                job,
                &mut *self.ring,
                &mut self.registry,
                &mut in_flight,
                &mut report,
            );

            // ── Step 2: One submit for the whole batch ──
            if queued > 0 {
                self.submit(queued, &mut in_flight, &mut report);
            }

            // ── Step 3: Reap whatever is ready ──
            let reaped = reaper::drain_available(
                &mut *self.ring,
                &mut self.registry,
                &mut in_flight,
                &mut report,
            );

            // ── Step 4: Done? ──
            if scheduler.is_done() && in_flight.is_idle() {
                break;
            }

            // ── Step 5: Pause if nothing moved ──
            if queued == 0 && reaped == 0 {
                idle.pause(&mut *self.ring);
            } else {
                idle.reset();
            }
        }

        info!(
            requests = report.requests,
            bytes_written = report.bytes_written,
            failed = report.failures.len(),
            peak_in_flight = report.peak_in_flight,
            batches = report.batches,
            "write finished"
        );
        Ok(report)
    }

    /// `run`, failing with `RequestsFailed` unless every byte was written.
    pub fn write_all(&mut self, job: &WriteJob<'_>) -> Result<WriteReport> {
        self.run(job)?.into_result()
    }

    /// Submit the queued batch. Transient errors are retried after reaping
    /// whatever has completed; anything else is fatal, since the queued
    /// requests can neither be issued nor withdrawn.
    fn submit(&mut self, queued: usize, in_flight: &mut InFlight, report: &mut WriteReport) {
        loop {
            match self.ring.submit() {
                Ok(submitted) => {
                    report.batches += 1;
                    debug!(queued, submitted, in_flight = in_flight.count(), "submitted batch");
                    return;
                }
                Err(e) if e.is_transient() => {
                    report.submit_retries += 1;
                    warn!(error = %e, queued, "submit busy, reaping before retry");
                    let reaped = reaper::drain_available(
                        &mut *self.ring,
                        &mut self.registry,
                        in_flight,
                        report,
                    );
                    if reaped == 0 {
                        std::thread::yield_now();
                    }
                }
                Err(e) => panic!("FATAL: submitting {queued} writes failed: {e}"),
            }
        }
    }
}

/// One-shot write: build an engine over `ring` and run `job` on it.
pub fn run<R: WriteRing>(
    job: &WriteJob<'_>,
    ring: &mut R,
    config: EngineConfig,
) -> Result<WriteReport> {
    WriteEngine::new(ring, config)?.run(job)
}

impl<R: WriteRing> Drop for WriteEngine<'_, R> {
    fn drop(&mut self) {
        // Only reachable while unwinding from a fatal error. The kernel may
        // still read these iovecs, so they must not be freed.
        let live = self.registry.live();
        if live > 0 {
            error!(live, "engine dropped with requests in flight; leaking their segments");
            let registry = std::mem::replace(&mut self.registry, SegmentRegistry::with_capacity(0));
            std::mem::forget(registry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diow_core::align::AlignedBuf;
    use diow_core::config::DrainMode;
    use diow_core::job::Target;
    use diow_module::mem_ring::{Fault, MemRing};
    use std::time::Duration;

    const BLOCK: usize = 8192;

    /// Alphabet pattern with a newline every 27th byte.
    fn pattern(len: usize, align: usize, skew: usize) -> AlignedBuf {
        let mut buf = AlignedBuf::with_skew(len, align, skew).unwrap();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = if i % 27 < 26 { b'a' + (i % 26) as u8 } else { b'\n' };
        }
        buf
    }

    fn config(depth: u32, max_segments: usize) -> EngineConfig {
        EngineConfig::new()
            .queue_depth(depth)
            .block_size(BLOCK)
            .max_segments(max_segments)
    }

    #[test]
    fn writes_whole_buffer_in_order() {
        let buf = pattern(BLOCK * 1024, 4096, 0);
        let mut ring = MemRing::new(64);
        let config = config(64, 512);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let mut engine = WriteEngine::new(&mut ring, config).unwrap();
        let report = engine.write_all(&job).unwrap();
        assert_eq!(report.requests, 2);
        assert_eq!(report.bytes_written, buf.len());
        assert_eq!(engine.registry().live(), 0);
        drop(engine);

        assert_eq!(ring.contents(), &buf[..]);
        let reqs = ring.requests();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].offset, 0);
        assert_eq!(reqs[1].offset, (BLOCK * 512) as u64);
        assert!(reqs.iter().all(|r| r.iovcnt == 512 && r.target == Target::Fixed(0)));
    }

    #[test]
    fn remainder_request_is_shorter() {
        let buf = pattern(BLOCK * 10, 4096, 0);
        let mut ring = MemRing::new(8);
        let config = config(8, 4);
        let job = WriteJob::with_config(&buf, Target::Fd(7), 0, &config).unwrap();

        let report = run(&job, &mut ring, config).unwrap();
        assert!(report.is_success());

        let sizes: Vec<usize> = ring.requests().iter().map(|r| r.bytes).collect();
        assert_eq!(sizes, vec![BLOCK * 4, BLOCK * 4, BLOCK * 2]);
        assert_eq!(ring.requests()[2].iovcnt, 2);
        assert_eq!(ring.contents(), &buf[..]);
    }

    #[test]
    fn sub_page_blocks_on_aligned_buffer() {
        let buf = pattern(2048, 4096, 0);
        let mut ring = MemRing::new(4);
        let config = EngineConfig::new()
            .queue_depth(4)
            .block_size(512)
            .max_segments(2);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let report = run(&job, &mut ring, config).unwrap();
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.requests, 2);
        assert_eq!(report.bytes_written, 2048);
        assert_eq!(ring.contents(), &buf[..]);
    }

    #[test]
    fn one_submit_when_depth_covers_job() {
        let buf = pattern(BLOCK * 4, 4096, 0);
        let mut ring = MemRing::new(8);
        let config = config(8, 1);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let report = run(&job, &mut ring, config).unwrap();
        assert_eq!(report.requests, 4);
        assert_eq!(report.batches, 1);
        assert_eq!(ring.submit_calls(), 1);
        assert_eq!(ring.peak_outstanding(), 4);
    }

    #[test]
    fn one_submit_per_fill_pass() {
        let buf = pattern(BLOCK * 16, 4096, 0);
        let mut ring = MemRing::new(4);
        let config = config(4, 1);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let report = run(&job, &mut ring, config).unwrap();
        assert!(report.is_success());
        assert_eq!(report.requests, 16);
        assert_eq!(ring.submit_calls(), report.batches as u64);
        assert!(ring.submit_calls() < 16);
        assert_eq!(ring.contents(), &buf[..]);
    }

    #[test]
    fn in_flight_never_exceeds_depth() {
        let buf = pattern(BLOCK * 64, 4096, 0);
        let mut ring = MemRing::new(16).batch(1).stall_every(3);
        let config = config(3, 1);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let mut engine = WriteEngine::new(&mut ring, config).unwrap();
        let report = engine.run(&job).unwrap();
        assert!(report.is_success());
        assert_eq!(report.requests, 64);
        assert!(report.peak_in_flight <= 3);
        assert!(report.batches > 1);
        drop(engine);

        assert!(ring.peak_outstanding() <= 3);
        assert_eq!(ring.contents(), &buf[..]);
    }

    #[test]
    fn ring_smaller_than_configured_depth_limits_depth() {
        let buf = pattern(BLOCK * 32, 4096, 0);
        let mut ring = MemRing::new(4);
        let config = config(64, 1);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let mut engine = WriteEngine::new(&mut ring, config).unwrap();
        assert_eq!(engine.depth(), 4);
        let report = engine.run(&job).unwrap();
        assert!(report.is_success());
        assert_eq!(report.peak_in_flight, 4);
        drop(engine);
        assert_eq!(ring.peak_outstanding(), 4);
    }

    #[test]
    fn every_segment_array_released_once() {
        let buf = pattern(BLOCK * 40, 4096, 0);
        let mut ring = MemRing::new(8).batch(3);
        let config = config(5, 3);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let mut engine = WriteEngine::new(&mut ring, config).unwrap();
        let first = engine.run(&job).unwrap();
        let second = engine.run(&job).unwrap();
        assert_eq!(first.requests, 14);
        assert_eq!(second.requests, 14);
        assert_eq!(engine.registry().allocated(), 28);
        assert_eq!(engine.registry().released(), 28);
        assert_eq!(engine.registry().live(), 0);
    }

    #[test]
    fn nonzero_file_offset() {
        let buf = pattern(BLOCK * 4, 4096, 0);
        let mut ring = MemRing::new(4);
        let config = config(4, 1);
        let origin = (BLOCK * 3) as u64;
        let job = WriteJob::with_config(&buf, Target::Fixed(0), origin, &config).unwrap();

        WriteEngine::new(&mut ring, config).unwrap().write_all(&job).unwrap();
        let contents = ring.contents();
        assert_eq!(contents.len(), BLOCK * 7);
        assert!(contents[..BLOCK * 3].iter().all(|&b| b == 0));
        assert_eq!(&contents[BLOCK * 3..], &buf[..]);
        assert_eq!(ring.requests()[0].offset, origin);
    }

    #[test]
    fn misaligned_buffer_fails_every_request_and_terminates() {
        let buf = pattern(BLOCK * 1024, 4096, 1);
        let mut ring = MemRing::new(64);
        let config = config(64, 512);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let mut engine = WriteEngine::new(&mut ring, config).unwrap();
        let report = engine.run(&job).unwrap();
        assert_eq!(report.requests, 2);
        assert_eq!(report.completions, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report
            .failures
            .iter()
            .all(|f| f.kind == FailureKind::Errno(libc::EINVAL)));
        assert_eq!(report.bytes_written, 0);
        assert!(!report.is_success());
        assert_eq!(engine.registry().live(), 0);

        match engine.write_all(&job) {
            Err(DiowError::RequestsFailed { failed, first_errno }) => {
                assert_eq!(failed, 2);
                assert_eq!(first_errno, libc::EINVAL);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn request_failures_do_not_stop_the_write() {
        let buf = pattern(BLOCK * 8, 4096, 0);
        let mut ring = MemRing::new(4)
            .inject(1, Fault::Errno(libc::EIO))
            .inject(5, Fault::Short(BLOCK / 2));
        let config = config(4, 1);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let report = WriteEngine::new(&mut ring, config).unwrap().run(&job).unwrap();
        assert_eq!(report.requests, 8);
        assert_eq!(report.completions, 8);
        assert_eq!(report.bytes_written, BLOCK * 6 + BLOCK / 2);

        let mut failures = report.failures.clone();
        failures.sort_by_key(|f| f.file_offset);
        assert_eq!(
            failures,
            vec![
                RequestFailure {
                    file_offset: BLOCK as u64,
                    len: BLOCK,
                    kind: FailureKind::Errno(libc::EIO),
                },
                RequestFailure {
                    file_offset: (BLOCK * 5) as u64,
                    len: BLOCK,
                    kind: FailureKind::Short { written: BLOCK / 2 },
                },
            ]
        );
        assert_eq!(&ring.contents()[BLOCK * 6..], &buf[BLOCK * 6..]);
    }

    #[test]
    fn transient_submit_error_is_retried() {
        let buf = pattern(BLOCK * 4, 4096, 0);
        let mut ring = MemRing::new(4);
        ring.fail_next_submit(libc::EAGAIN);
        let config = config(4, 1);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let report = WriteEngine::new(&mut ring, config).unwrap().write_all(&job).unwrap();
        assert_eq!(report.submit_retries, 1);
        assert_eq!(ring.contents(), &buf[..]);
    }

    #[test]
    #[should_panic(expected = "FATAL: submitting")]
    fn hard_submit_error_is_fatal() {
        let buf = pattern(BLOCK * 4, 4096, 0);
        let mut ring = MemRing::new(4);
        ring.fail_next_submit(libc::EBADF);
        let config = config(4, 1);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();
        let _ = WriteEngine::new(&mut ring, config).unwrap().run(&job);
    }

    #[test]
    fn wait_mode_blocks_for_completions() {
        let buf = pattern(BLOCK * 16, 4096, 0);
        let mut ring = MemRing::new(4).batch(1).stall_every(2);
        let config = config(4, 2).drain_mode(DrainMode::Wait);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let report = WriteEngine::new(&mut ring, config).unwrap().write_all(&job).unwrap();
        assert_eq!(report.requests, 8);
        assert_eq!(ring.contents(), &buf[..]);
    }

    #[test]
    fn backoff_mode_completes() {
        let buf = pattern(BLOCK * 16, 4096, 0);
        let mut ring = MemRing::new(2).batch(1).stall_every(2);
        let mode = DrainMode::Backoff {
            initial: Duration::from_micros(1),
            max: Duration::from_micros(8),
        };
        let config = config(2, 1).drain_mode(mode);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

        let report = WriteEngine::new(&mut ring, config).unwrap().write_all(&job).unwrap();
        assert_eq!(report.requests, 16);
        assert!(report.peak_in_flight <= 2);
        assert_eq!(ring.contents(), &buf[..]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut ring = MemRing::new(4);
        assert!(WriteEngine::new(&mut ring, EngineConfig::new().queue_depth(0)).is_err());
        assert!(WriteEngine::new(&mut ring, EngineConfig::new().max_segments(0)).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn uring_writes_file() {
        use diow_module::target::open_direct;
        use diow_module::{RingConfig, UringRing};
        use std::os::fd::AsRawFd;

        let mut ring = match UringRing::new(RingConfig::new().sq_entries(8)) {
            Ok(ring) => ring,
            Err(e) => {
                eprintln!("skipping: io_uring unavailable: {e}");
                return;
            }
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = match open_direct(&path) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("skipping: O_DIRECT unsupported here: {e}");
                return;
            }
        };
        ring.register_files(&[file.as_raw_fd()]).unwrap();

        let buf = pattern(BLOCK * 64, 4096, 0);
        let config = config(8, 16);
        let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();
        let report = WriteEngine::new(&mut ring, config).unwrap().run(&job).unwrap();
        if report
            .failures
            .iter()
            .any(|f| f.kind == FailureKind::Errno(libc::EINVAL))
        {
            eprintln!("skipping: filesystem rejects O_DIRECT writes");
            return;
        }
        assert!(report.is_success());
        assert_eq!(report.requests, 4);
        assert_eq!(std::fs::read(&path).unwrap(), &buf[..]);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]

        #[test]
        fn request_sizes_cover_buffer(
            blocks in 1usize..200,
            max_segments in 1usize..32,
            depth in 1u32..16,
            ring_batch in 1usize..8,
        ) {
            let block = 512;
            let buf = pattern(block * blocks, 4096, 0);
            let mut ring = MemRing::new(16).batch(ring_batch);
            let config = EngineConfig::new()
                .queue_depth(depth)
                .block_size(block)
                .max_segments(max_segments);
            let job = WriteJob::with_config(&buf, Target::Fixed(0), 0, &config).unwrap();

            let mut engine = WriteEngine::new(&mut ring, config).unwrap();
            let report = engine.run(&job).unwrap();
            let (allocated, released) =
                (engine.registry().allocated(), engine.registry().released());
            drop(engine);

            let chunk = block * max_segments;
            let reqs = ring.requests();
            proptest::prop_assert_eq!(reqs.len(), (block * blocks).div_ceil(chunk));
            proptest::prop_assert_eq!(reqs.iter().map(|r| r.bytes).sum::<usize>(), buf.len());
            proptest::prop_assert!(reqs.iter().all(|r| r.bytes <= chunk));
            proptest::prop_assert!(report.peak_in_flight <= depth);
            proptest::prop_assert!(ring.peak_outstanding() <= depth);
            proptest::prop_assert_eq!(allocated, reqs.len() as u64);
            proptest::prop_assert_eq!(released, allocated);
            proptest::prop_assert_eq!(ring.contents(), &buf[..]);
        }
    }
}
