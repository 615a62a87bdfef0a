//! Engine configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on the returned value
//! 2. Environment variables (`from_env`)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use diow_core::config::{DrainMode, EngineConfig};
//!
//! let config = EngineConfig::from_env()
//!     .queue_depth(32)
//!     .drain_mode(DrainMode::Wait);
//! config.validate()?;
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::env::{env_get, env_get_opt};
use crate::error::{DiowError, Result};
use crate::UIO_MAXIOV;

/// Library defaults.
pub mod defaults {
    /// Maximum requests in flight at once.
    pub const QUEUE_DEPTH: u32 = 64;
    /// Bytes per scatter/gather segment.
    pub const BLOCK_SIZE: usize = 8192;
    /// Segments per request.
    pub const MAX_SEGMENTS: usize = 512;
    /// Required alignment of the buffer base address.
    pub const MEM_ALIGN: usize = 4096;
    /// First sleep of the backoff drain strategy.
    pub const BACKOFF_INITIAL_US: u64 = 10;
    /// Backoff ceiling.
    pub const BACKOFF_MAX_US: u64 = 1000;
}

/// How the engine waits when a drain pass finds no completions and no
/// more requests can be issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainMode {
    /// Spin on the non-blocking peek.
    #[default]
    Poll,
    /// Yield, then sleep with exponential backoff between empty polls.
    Backoff { initial: Duration, max: Duration },
    /// Block in the ring until a completion arrives.
    Wait,
}

impl DrainMode {
    pub fn backoff() -> Self {
        Self::Backoff {
            initial: Duration::from_micros(defaults::BACKOFF_INITIAL_US),
            max: Duration::from_micros(defaults::BACKOFF_MAX_US),
        }
    }
}

impl FromStr for DrainMode {
    type Err = DiowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "poll" | "busy" => Ok(Self::Poll),
            "backoff" => Ok(Self::backoff()),
            "wait" | "block" => Ok(Self::Wait),
            _ => Err(DiowError::InvalidConfig(
                "drain mode must be one of poll, backoff, wait",
            )),
        }
    }
}

/// Engine configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum requests in flight.
    pub queue_depth: u32,
    /// Segment size; also the length alignment of every request.
    pub block_size: usize,
    /// Segments per request.
    pub max_segments: usize,
    /// Buffer base alignment required by the device.
    pub mem_align: usize,
    /// Behaviour when there is nothing to reap.
    pub drain_mode: DrainMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    /// Create config from defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `DIOW_QUEUE_DEPTH` - In-flight request limit
    /// - `DIOW_BLOCK_SIZE` - Segment size in bytes
    /// - `DIOW_MAX_SEGMENTS` - Segments per request
    /// - `DIOW_MEM_ALIGN` - Buffer alignment in bytes
    /// - `DIOW_DRAIN_MODE` - `poll`, `backoff` or `wait`
    pub fn from_env() -> Self {
        Self {
            queue_depth: env_get("DIOW_QUEUE_DEPTH", defaults::QUEUE_DEPTH),
            block_size: env_get("DIOW_BLOCK_SIZE", defaults::BLOCK_SIZE),
            max_segments: env_get("DIOW_MAX_SEGMENTS", defaults::MAX_SEGMENTS),
            mem_align: env_get("DIOW_MEM_ALIGN", defaults::MEM_ALIGN),
            drain_mode: env_get_opt("DIOW_DRAIN_MODE").unwrap_or_default(),
        }
    }

    /// Create config with explicit defaults (no env override).
    pub fn new() -> Self {
        Self {
            queue_depth: defaults::QUEUE_DEPTH,
            block_size: defaults::BLOCK_SIZE,
            max_segments: defaults::MAX_SEGMENTS,
            mem_align: defaults::MEM_ALIGN,
            drain_mode: DrainMode::Poll,
        }
    }

    // Builder methods

    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn max_segments(mut self, n: usize) -> Self {
        self.max_segments = n;
        self
    }

    pub fn mem_align(mut self, align: usize) -> Self {
        self.mem_align = align;
        self
    }

    pub fn drain_mode(mut self, mode: DrainMode) -> Self {
        self.drain_mode = mode;
        self
    }

    /// Largest request the engine will build.
    pub fn max_request_bytes(&self) -> usize {
        self.block_size * self.max_segments
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 || self.queue_depth > 4096 {
            return Err(DiowError::InvalidConfig("queue_depth must be in 1..=4096"));
        }
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(DiowError::InvalidConfig(
                "block_size must be a power of two >= 512",
            ));
        }
        if self.mem_align < 512 || !self.mem_align.is_power_of_two() {
            return Err(DiowError::InvalidConfig(
                "mem_align must be a power of two >= 512",
            ));
        }
        if self.max_segments == 0 || self.max_segments > UIO_MAXIOV {
            return Err(DiowError::InvalidConfig("max_segments must be in 1..=1024"));
        }
        // The completion result is an i32 byte count.
        if self.block_size.checked_mul(self.max_segments).map_or(true, |n| n > i32::MAX as usize) {
            return Err(DiowError::InvalidConfig(
                "block_size * max_segments must fit a single completion result",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::new();
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.max_request_bytes(), 8192 * 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .queue_depth(8)
            .block_size(4096)
            .max_segments(4)
            .drain_mode(DrainMode::Wait);

        assert_eq!(config.queue_depth, 8);
        assert_eq!(config.max_request_bytes(), 16384);
        assert_eq!(config.drain_mode, DrainMode::Wait);
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::new().queue_depth(0).validate().is_err());
        assert!(EngineConfig::new().queue_depth(48).validate().is_ok());
        assert!(EngineConfig::new().queue_depth(4097).validate().is_err());
        assert!(EngineConfig::new().block_size(1000).validate().is_err());
        assert!(EngineConfig::new().block_size(256).validate().is_err());
        assert!(EngineConfig::new().max_segments(0).validate().is_err());
        assert!(EngineConfig::new().max_segments(2048).validate().is_err());
        assert!(EngineConfig::new().mem_align(3).validate().is_err());
    }

    #[test]
    fn test_drain_mode_parse() {
        assert_eq!("poll".parse::<DrainMode>().unwrap(), DrainMode::Poll);
        assert_eq!(" WAIT ".parse::<DrainMode>().unwrap(), DrainMode::Wait);
        assert!(matches!(
            "backoff".parse::<DrainMode>().unwrap(),
            DrainMode::Backoff { .. }
        ));
        assert!("spin-forever".parse::<DrainMode>().is_err());
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("DIOW_MAX_SEGMENTS", "16");
        let config = EngineConfig::from_env();
        assert_eq!(config.max_segments, 16);
        std::env::remove_var("DIOW_MAX_SEGMENTS");
    }
}
