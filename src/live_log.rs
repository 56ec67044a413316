//! Best-effort live-log fan-out over named pipes.
//!
//! Subscribers create a FIFO under the live-log directory; writers open each
//! FIFO non-blocking and push log lines and commit hashes into it. A slow or
//! absent reader must never stall the writing process, so every failure on
//! the write side is swallowed; a FIFO with no reader at all is treated as
//! stale and removed.

use std::ffi::CString;
use std::fs;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::paths::Paths;

/// Broadcast one line to every subscriber. Never fails, never blocks.
pub fn broadcast(paths: &Paths, line: &str) {
    let dir = paths.live_log_dir();
    let Ok(entries) = fs::read_dir(&dir) else {
        return;
    };
    let payload = format!("{line}\n");
    for entry in entries.flatten() {
        let path = entry.path();
        match write_nonblocking(&path, payload.as_bytes()) {
            WriteOutcome::Written | WriteOutcome::WouldBlock => {}
            WriteOutcome::NoReader => {
                // Nobody will ever read this pipe again.
                let _ = fs::remove_file(&path);
            }
        }
    }
}

enum WriteOutcome {
    Written,
    WouldBlock,
    NoReader,
}

fn write_nonblocking(path: &Path, payload: &[u8]) -> WriteOutcome {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return WriteOutcome::NoReader;
    };
    // O_NONBLOCK on a FIFO with no reader fails with ENXIO instead of
    // blocking until one appears.
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
    if fd < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return if errno == libc::ENXIO {
            WriteOutcome::NoReader
        } else {
            WriteOutcome::WouldBlock
        };
    }
    let n = unsafe { libc::write(fd, payload.as_ptr().cast(), payload.len()) };
    unsafe { libc::close(fd) };
    if n < 0 {
        WriteOutcome::WouldBlock
    } else {
        WriteOutcome::Written
    }
}

/// Create this process's subscription FIFO and return its path.
pub fn create_subscription(paths: &Paths) -> Result<PathBuf> {
    let dir = paths.live_log_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating live-log directory '{}'", dir.display()))?;
    let path = dir.join(format!("{}.fifo", std::process::id()));
    let cpath = CString::new(path.as_os_str().as_bytes()).context("encoding FIFO path")?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        bail!(
            "creating live-log FIFO '{}': {}",
            path.display(),
            std::io::Error::last_os_error()
        );
    }
    Ok(path)
}

/// Follow the live log, printing every line as it arrives. Runs until the
/// process is interrupted.
pub fn follow(paths: &Paths) -> Result<()> {
    let path = create_subscription(paths)?;
    println!("Waiting for registry activity. Press Ctrl-C to stop.");

    // Open read-nonblocking so we do not deadlock waiting for a writer.
    let cpath = CString::new(path.as_os_str().as_bytes()).context("encoding FIFO path")?;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        let _ = fs::remove_file(&path);
        bail!("opening live-log FIFO '{}': {err}", path.display());
    }
    let mut file = unsafe { <fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };

    let mut buf = [0u8; 4096];
    let mut pending = Vec::new();
    loop {
        match file.read(&mut buf) {
            Ok(0) => std::thread::sleep(Duration::from_millis(200)),
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    print!("{}", String::from_utf8_lossy(&line));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e).context("reading live-log FIFO");
            }
        }
    }
}
