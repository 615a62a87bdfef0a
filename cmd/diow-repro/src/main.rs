//! diow O_DIRECT alignment reproduction
//!
//! Writes `block_size * 1024` bytes of a repeating `a..z\n` pattern to a
//! file opened with `O_DIRECT`, through io_uring vectored writes, then
//! reads the file back and compares it with the buffer.
//!
//! An aligned buffer writes cleanly. With `DIOW_MISALIGN=1` the buffer
//! starts one byte past its alignment boundary and every request comes
//! back with `EINVAL`.
//!
//! Run: sudo ./target/release/diow-repro
//!
//! Environment (all optional):
//! - `DIOW_PATH` - output file (default `test.txt`)
//! - `DIOW_BACKEND` - `uring` (default) or `mem`
//! - `DIOW_MISALIGN` - skew the buffer by one byte
//! - `DIOW_REGISTER_FILES` - use a registered file index (default on)
//! - `DIOW_SKIP_ROOT_CHECK` - run without root
//! - `DIOW_LOG` - log filter (default `info`)
//! - plus the `EngineConfig` and `RingConfig` variables

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;

use diow_core::align::AlignedBuf;
use diow_core::config::EngineConfig;
use diow_core::env::{env_get_bool, env_get_str};
use diow_core::error::{strerror, DiowError, Result};
use diow_core::job::{Target, WriteJob};
use diow_core::ring::WriteRing;
use diow_executor::{WriteEngine, WriteReport};
use diow_module::target::{is_root, open_direct, probe_block_size};
use diow_module::{MemRing, RingConfig, UringRing};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Buffer size in blocks.
const FILE_BLOCKS: usize = 1024;

const LINE: &str = "────────────────────────────────────────────────────────────";

/// `a` through `z` then a newline, repeating.
fn fill_pattern(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = if i % 27 < 26 { b'a' + (i % 26) as u8 } else { b'\n' };
    }
}

/// Offset of the first byte where `written` differs from `expected`.
fn first_mismatch(expected: &[u8], written: &[u8]) -> Option<usize> {
    expected
        .iter()
        .zip(written)
        .position(|(a, b)| a != b)
        .or_else(|| (expected.len() != written.len()).then(|| expected.len().min(written.len())))
}

struct Outcome {
    report: WriteReport,
    written: Vec<u8>,
}

fn run_uring(config: &EngineConfig, buf: &[u8]) -> Result<Outcome> {
    let path = PathBuf::from(env_get_str("DIOW_PATH", "test.txt"));
    let file = open_direct(&path)?;
    if let Some(bs) = probe_block_size(file.as_raw_fd()) {
        if config.block_size % bs != 0 {
            warn!(block_size = config.block_size, fs_block = bs, "block size is not a multiple of the filesystem block");
        }
    }

    let mut ring = UringRing::new(RingConfig::from_env())?;
    let registered = env_get_bool("DIOW_REGISTER_FILES", true);
    let target = if registered {
        ring.register_files(&[file.as_raw_fd()])?;
        Target::Fixed(0)
    } else {
        Target::Fd(file.as_raw_fd())
    };
    info!(path = %path.display(), ?target, "target open");

    let job = WriteJob::with_config(buf, target, 0, config)?;
    let report = WriteEngine::new(&mut ring, config.clone())?.run(&job)?;
    if registered {
        if let Err(e) = ring.unregister_files() {
            warn!(error = %e, "unregistering target file");
        }
    }
    drop(ring);
    drop(file);

    let written = std::fs::read(&path).map_err(|e| DiowError::from_io(&e))?;
    Ok(Outcome { report, written })
}

fn run_mem(config: &EngineConfig, buf: &[u8]) -> Result<Outcome> {
    let mut ring = MemRing::new(config.queue_depth);
    let job = WriteJob::with_config(buf, Target::Fixed(0), 0, config)?;
    let report = WriteEngine::new(&mut ring, config.clone())?.run(&job)?;
    Ok(Outcome {
        report,
        written: ring.contents().to_vec(),
    })
}

fn print_summary(backend: &str, buf: &AlignedBuf, outcome: &Outcome, mismatch: Option<usize>) {
    let r = &outcome.report;
    println!("{}", LINE);
    println!("  diow-repro ({backend})");
    println!("{}", LINE);
    println!(
        "  buffer      {} bytes at {:p} ({})",
        buf.len(),
        buf.as_ptr(),
        if buf.is_aligned_to(buf.align()) { "aligned" } else { "misaligned" }
    );
    println!(
        "  requests    {}  completed {}  failed {}",
        r.requests,
        r.completions,
        r.failures.len()
    );
    println!("  in flight   peak {}  batches {}  submit retries {}", r.peak_in_flight, r.batches, r.submit_retries);
    println!("  written     {} of {} bytes", r.bytes_written, r.bytes_requested);
    if let Some(f) = r.failures.first() {
        println!(
            "  first error offset {} len {}: {}",
            f.file_offset,
            f.len,
            strerror(f.kind.errno())
        );
    }
    match mismatch {
        None => println!("  verify      file matches buffer"),
        Some(at) => println!(
            "  verify      MISMATCH at byte {at} (file is {} bytes)",
            outcome.written.len()
        ),
    }
    println!("{}", LINE);
}

fn run() -> Result<bool> {
    let config = EngineConfig::from_env();
    config.validate()?;

    let skew = usize::from(env_get_bool("DIOW_MISALIGN", false));
    let mut buf = AlignedBuf::with_skew(config.block_size * FILE_BLOCKS, config.mem_align, skew)?;
    fill_pattern(&mut buf);

    let backend = env_get_str("DIOW_BACKEND", "uring");
    let outcome = match backend.as_str() {
        "uring" => run_uring(&config, &buf)?,
        "mem" => run_mem(&config, &buf)?,
        _ => return Err(DiowError::InvalidConfig("DIOW_BACKEND must be uring or mem")),
    };

    let mismatch = first_mismatch(&buf, &outcome.written);
    print_summary(&backend, &buf, &outcome, mismatch);
    Ok(outcome.report.is_success() && mismatch.is_none())
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("DIOW_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if !env_get_bool("DIOW_SKIP_ROOT_CHECK", false) && !is_root() {
        eprintln!("You need root privileges to run this program.");
        return ExitCode::FAILURE;
    }

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("diow-repro: {e}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_has_27_byte_period() {
        let mut buf = vec![0u8; 60];
        fill_pattern(&mut buf);
        assert_eq!(&buf[..27], b"abcdefghijklmnopqrstuvwxyz\n");
        assert_eq!(&buf[27..54], &buf[..27]);
    }

    #[test]
    fn mismatch_detection() {
        assert_eq!(first_mismatch(b"abc", b"abc"), None);
        assert_eq!(first_mismatch(b"abc", b"abd"), Some(2));
        assert_eq!(first_mismatch(b"abc", b""), Some(0));
        assert_eq!(first_mismatch(b"abc", b"abcd"), Some(3));
    }
}
