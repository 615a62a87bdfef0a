//! # diow-core — Types and traits for the direct-I/O write engine
//!
//! This crate holds everything the engine needs that is not tied to a
//! particular submission backend:
//!
//! - `job` - `WriteJob` and the `Target` it writes to
//! - `segment` - `SegmentArray` and the descriptor packer
//! - `token` - correlation `Token`s and the `SegmentRegistry`
//! - `inflight` - the bounded in-flight counter
//! - `ring` - the `WriteRing` trait every backend implements
//! - `align` - alignment policy and `AlignedBuf`
//! - `config` - engine configuration with env overrides
//! - `env` - environment variable helpers
//! - `error` - `DiowError`
//!
//! ## Design principle
//!
//! The engine is written against `WriteRing`, never against io_uring
//! directly. `diow-module` provides the io_uring implementation and an
//! in-memory one; swapping them does not touch the engine.

pub mod align;
pub mod config;
pub mod env;
pub mod error;
pub mod inflight;
pub mod job;
pub mod ring;
pub mod segment;
pub mod token;

// Re-exports for convenience
pub use align::{AlignedBuf, AlignmentPolicy};
pub use config::{DrainMode, EngineConfig};
pub use error::{DiowError, Result};
pub use inflight::InFlight;
pub use job::{Target, WriteJob};
pub use ring::{RingCompletion, WriteRing};
pub use segment::{pack, try_pack, SegmentArray};
pub use token::{SegmentRegistry, Token};

/// Linux caps a single vectored request at this many iovecs.
pub const UIO_MAXIOV: usize = 1024;
