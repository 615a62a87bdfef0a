//! # diow-module — `WriteRing` implementations
//!
//! | Impl       | Platform | Purpose                                       |
//! |------------|----------|-----------------------------------------------|
//! | `UringRing`| Linux    | io_uring, SQPOLL / IOPOLL, registered files   |
//! | `MemRing`  | any      | In-memory device with `O_DIRECT` rules        |
//!
//! `target` opens the destination file with `O_DIRECT` and probes its
//! block size.

pub mod mem_ring;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod uring_ring;
        pub mod target;

        pub use uring_ring::{RingConfig, UringRing};
    }
}

pub use mem_ring::MemRing;
