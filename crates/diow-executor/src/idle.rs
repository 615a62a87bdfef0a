//! What the engine does when a pass made no progress.

use std::thread;
use std::time::Duration;

use diow_core::config::DrainMode;
use diow_core::ring::WriteRing;

/// Yields before the first sleep in backoff mode.
const BACKOFF_YIELDS: u32 = 16;

pub(crate) struct Idle {
    mode: DrainMode,
    yields: u32,
    sleep: Duration,
}

impl Idle {
    pub(crate) fn new(mode: DrainMode) -> Self {
        let sleep = match mode {
            DrainMode::Backoff { initial, .. } => initial,
            _ => Duration::ZERO,
        };
        Self {
            mode,
            yields: 0,
            sleep,
        }
    }

    /// Progress was made; start backing off from scratch next time.
    pub(crate) fn reset(&mut self) {
        if let DrainMode::Backoff { initial, .. } = self.mode {
            self.yields = 0;
            self.sleep = initial;
        }
    }

    /// Wait a little before the next peek.
    pub(crate) fn pause<R: WriteRing>(&mut self, ring: &mut R) {
        match self.mode {
            DrainMode::Poll => std::hint::spin_loop(),
            DrainMode::Backoff { max, .. } => {
                if self.yields < BACKOFF_YIELDS {
                    self.yields += 1;
                    thread::yield_now();
                } else {
                    thread::sleep(self.sleep);
                    self.sleep = (self.sleep * 2).min(max);
                }
            }
            DrainMode::Wait => loop {
                match ring.wait_completion() {
                    Ok(()) => break,
                    Err(e) if e.is_transient() => continue,
                    Err(e) => panic!("FATAL: waiting for a completion failed: {e}"),
                }
            },
        }
    }
}
