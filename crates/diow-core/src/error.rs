//! diow error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiowError {
    /// The job violates a data-model invariant.
    #[error("invalid write job: {0}")]
    InvalidJob(&'static str),

    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// More bytes than one segment array can describe.
    #[error("too many bytes assigned to single segment array: {requested} bytes requested, {max} max")]
    ChunkTooLarge { requested: usize, max: usize },

    /// A buffer address, length or file offset breaks direct-I/O alignment.
    #[error("{what} {value:#x} is not aligned to {align} bytes")]
    Misaligned {
        what: &'static str,
        value: u64,
        align: usize,
    },

    /// No free submission queue entry.
    #[error("submission ring full")]
    RingFull,

    /// io_uring setup failed.
    #[error("io_uring setup: {}", errno_text(.0))]
    RingSetup(i32),

    /// Batched submit failed.
    #[error("io_uring submit: {}", errno_text(.0))]
    Submit(i32),

    /// File registration failed.
    #[error("registering files: {}", errno_text(.0))]
    Register(i32),

    /// Opening the target file failed.
    #[error("opening {}: {}", .path.display(), errno_text(.errno))]
    Open { path: PathBuf, errno: i32 },

    /// A completion carried a token the registry never issued, or one
    /// that was already released.
    #[error("unknown completion token {0:#x}")]
    UnknownToken(u64),

    /// One or more write requests completed with an error or short count.
    #[error("{failed} write request(s) failed, first error: {}", errno_text(.first_errno))]
    RequestsFailed { failed: usize, first_errno: i32 },

    /// OS error with errno.
    #[error("OS error: {}", errno_text(.0))]
    Os(i32),
}

impl DiowError {
    /// The underlying errno, if this error carries one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::RingSetup(e)
            | Self::Submit(e)
            | Self::Register(e)
            | Self::Os(e)
            | Self::Open { errno: e, .. }
            | Self::RequestsFailed { first_errno: e, .. } => Some(*e),
            _ => None,
        }
    }

    /// Build from a `std::io::Error`, keeping its errno.
    pub fn from_io(err: &std::io::Error) -> Self {
        Self::Os(err.raw_os_error().unwrap_or(libc::EIO))
    }

    /// Submit failures that clear up once completions are drained.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Submit(e) if *e == libc::EINTR || *e == libc::EAGAIN || *e == libc::EBUSY
        )
    }
}

/// Render an errno (positive or negative) as the system error text.
pub fn strerror(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno.abs()).to_string()
}

fn errno_text(errno: &i32) -> String {
    strerror(*errno)
}

pub type Result<T> = std::result::Result<T, DiowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_too_large_message() {
        let e = DiowError::ChunkTooLarge { requested: 9000, max: 8192 };
        assert_eq!(
            e.to_string(),
            "too many bytes assigned to single segment array: 9000 bytes requested, 8192 max"
        );
    }

    #[test]
    fn errno_is_exposed() {
        assert_eq!(DiowError::Submit(libc::EBUSY).errno(), Some(libc::EBUSY));
        assert_eq!(DiowError::RingFull.errno(), None);
        let e = DiowError::RequestsFailed { failed: 3, first_errno: libc::EINVAL };
        assert_eq!(e.errno(), Some(libc::EINVAL));
    }

    #[test]
    fn transient_submit_errors() {
        assert!(DiowError::Submit(libc::EAGAIN).is_transient());
        assert!(DiowError::Submit(libc::EINTR).is_transient());
        assert!(!DiowError::Submit(libc::EBADF).is_transient());
        assert!(!DiowError::RingFull.is_transient());
    }

    #[test]
    fn strerror_accepts_negative_errno() {
        assert_eq!(strerror(-libc::EINVAL), strerror(libc::EINVAL));
    }
}
