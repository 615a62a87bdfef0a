//! Completion side.

use diow_core::inflight::InFlight;
use diow_core::ring::WriteRing;
use diow_core::token::SegmentRegistry;

use crate::report::WriteReport;

/// Reap every completion the ring has ready, without blocking.
///
/// For each one: release the token's segments, record the result, then
/// acknowledge the entry and drop the in-flight count. Returns the number
/// reaped.
pub(crate) fn drain_available<R: WriteRing>(
    ring: &mut R,
    registry: &mut SegmentRegistry,
    in_flight: &mut InFlight,
    report: &mut WriteReport,
) -> usize {
    let mut reaped = 0;

    while !in_flight.is_idle() {
        let Some(completion) = ring.peek_completion() else {
            break;
        };

        let segments = match registry.release(completion.token) {
            Ok(segments) => segments,
            Err(e) => panic!("FATAL: completion does not match a live request: {e}"),
        };
        let buf_offset = segments.segment(0).map_or(0, |(off, _)| off);
        let requested = segments.total_bytes();
        drop(segments);

        report.record(&completion, buf_offset, requested);
        ring.acknowledge(&completion);
        in_flight.release();
        reaped += 1;
    }

    reaped
}
