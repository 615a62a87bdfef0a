//! Target file helpers.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use diow_core::error::{DiowError, Result};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::{fstat, Mode};

/// Open `path` for direct, write-only access, truncating or creating it.
pub fn open_direct(path: &Path) -> Result<OwnedFd> {
    let flags = OFlag::O_WRONLY | OFlag::O_TRUNC | OFlag::O_CREAT | OFlag::O_DIRECT;
    let fd = open(path, flags, Mode::from_bits_truncate(0o644)).map_err(|e| DiowError::Open {
        path: path.to_path_buf(),
        errno: e as i32,
    })?;
    // Safety: open just returned this fd and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Preferred I/O block size the filesystem reports for `fd`.
pub fn probe_block_size(fd: RawFd) -> Option<usize> {
    fstat(fd)
        .ok()
        .map(|st| st.st_blksize as usize)
        .filter(|&b| b > 0 && b.is_power_of_two())
}

/// True if running with effective uid 0.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn open_missing_dir_reports_path() {
        let err = open_direct(Path::new("/nonexistent-diow-dir/out.bin")).unwrap_err();
        match err {
            DiowError::Open { path, errno } => {
                assert_eq!(path, Path::new("/nonexistent-diow-dir/out.bin"));
                assert_eq!(errno, libc::ENOENT);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn probe_regular_file() {
        let file = tempfile::tempfile().unwrap();
        let bs = probe_block_size(file.as_raw_fd());
        assert!(bs.map_or(true, |b| b >= 512));
    }
}
