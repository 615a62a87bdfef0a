//! Completion correlation.
//!
//! Every submitted request carries a `Token` in the ring's `user_data`
//! field. The token names a slot in the `SegmentRegistry`, which owns the
//! request's `SegmentArray` until the completion for that token is seen.
//! Completions can arrive in any order; matching is by token only.

use crate::error::{DiowError, Result};
use crate::segment::SegmentArray;

/// Correlation token: slot index in the low 32 bits, slot generation in
/// the high 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Token(pub u64);

impl Token {
    pub const NONE: Self = Self(u64::MAX);

    #[inline]
    fn new(slot: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | slot as u64)
    }

    #[inline]
    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

struct Slot {
    generation: u32,
    segments: Option<SegmentArray>,
}

/// Fixed-capacity table of segment arrays owned by in-flight requests.
pub struct SegmentRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    allocated: u64,
    released: u64,
}

impl SegmentRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                segments: None,
            })
            .collect();
        // Pop from the back, so hand out slot 0 first.
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free,
            allocated: 0,
            released: 0,
        }
    }

    /// Park `segments` and return the token that will release them,
    /// along with the parked array.
    ///
    /// Returns `None` when every slot is occupied.
    pub fn insert(&mut self, segments: SegmentArray) -> Option<(Token, &SegmentArray)> {
        let slot = self.free.pop()?;
        self.allocated += 1;
        let entry = &mut self.slots[slot as usize];
        debug_assert!(entry.segments.is_none());
        let token = Token::new(slot, entry.generation);
        let parked: &SegmentArray = entry.segments.insert(segments);
        Some((token, parked))
    }

    /// Segments parked under `token`, if it is live.
    pub fn get(&self, token: Token) -> Option<&SegmentArray> {
        self.slots
            .get(token.slot() as usize)
            .filter(|s| s.generation == token.generation())
            .and_then(|s| s.segments.as_ref())
    }

    /// Take back the segments for `token`. A token can be released once;
    /// a second release, or a token this registry never issued, fails
    /// with `UnknownToken`.
    pub fn release(&mut self, token: Token) -> Result<SegmentArray> {
        let entry = self
            .slots
            .get_mut(token.slot() as usize)
            .filter(|s| s.generation == token.generation())
            .ok_or(DiowError::UnknownToken(token.0))?;
        let segments = entry
            .segments
            .take()
            .ok_or(DiowError::UnknownToken(token.0))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(token.slot());
        self.released += 1;
        Ok(segments)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Segment arrays currently parked.
    #[inline]
    pub fn live(&self) -> usize {
        (self.allocated - self.released) as usize
    }

    /// Total arrays ever parked.
    #[inline]
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Total arrays ever released.
    #[inline]
    pub fn released(&self) -> u64 {
        self.released
    }
}
