//! Advisory file lock serializing registry-mutating invocations.
//!
//! The lock is exclusive and acquisition is bounded by a short deadline;
//! contention surfaces as a user-facing error rather than an indefinite wait.
//! Read-only operations do not take the lock.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// RAII guard over the registry lock file.
///
/// The lock file itself is never unlinked: removing a still-locked file would
/// let a second process create a fresh file at the same path and acquire a
/// separate exclusive lock, defeating mutual exclusion.
#[derive(Debug)]
pub struct RegistryLock {
    _file: File,
}

impl RegistryLock {
    /// Acquire the lock, retrying until the deadline.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory '{}'", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("opening lock file '{}'", lock_path.display()))?;

        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            if file.try_lock_exclusive().is_ok() {
                return Ok(Self { _file: file });
            }
            if Instant::now() >= deadline {
                bail!(
                    "another subuser process is currently modifying the registry \
                     (could not acquire '{}'). Wait for it to finish and retry.",
                    lock_path.display()
                );
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquires_and_releases() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.lock");
        let guard = RegistryLock::acquire(&path).expect("first acquire");
        drop(guard);
        RegistryLock::acquire(&path).expect("reacquire after release");
    }

    #[test]
    fn contention_times_out_with_guidance() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.lock");
        let _held = RegistryLock::acquire(&path).expect("first acquire");

        let err = RegistryLock::acquire(&path).expect_err("second acquire must time out");
        assert!(err.to_string().contains("another subuser process"));
    }
}
