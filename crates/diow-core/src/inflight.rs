//! Bounded in-flight request counter.

/// Requests submitted but not yet reaped. Never exceeds `depth`.
///
/// The scheduler increments, the reaper decrements; both run on the
/// caller's thread, so this is a plain counter. Going over `depth` or
/// below zero means the accounting is broken, and both panic.
#[derive(Debug, Clone)]
pub struct InFlight {
    count: u32,
    depth: u32,
    peak: u32,
}

impl InFlight {
    pub fn new(depth: u32) -> Self {
        assert!(depth > 0, "FATAL: queue depth must be non-zero");
        Self {
            count: 0,
            depth,
            peak: 0,
        }
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Highest count observed.
    #[inline]
    pub fn peak(&self) -> u32 {
        self.peak
    }

    #[inline]
    pub fn has_capacity(&self) -> bool {
        self.count < self.depth
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.count == 0
    }

    pub fn acquire(&mut self) {
        assert!(
            self.count < self.depth,
            "FATAL: in-flight count {} would exceed queue depth {}",
            self.count,
            self.depth
        );
        self.count += 1;
        self.peak = self.peak.max(self.count);
    }

    pub fn release(&mut self) {
        assert!(self.count > 0, "FATAL: completion reaped with nothing in flight");
        self.count -= 1;
    }
}
