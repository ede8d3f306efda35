//! Locking for the lifecycle store
//!
//! Two layers:
//! - [`ProductLocks`]: in-process, one writer per product id. Different ids
//!   proceed in parallel.
//! - [`FileLock`]: advisory `flock` on a lock file in the base directory, so
//!   separate processes agree on who may touch vault ciphertext. Stage
//!   operations hold it shared; key rotation holds it exclusive.
//!
//! Both wait up to a timeout and log contention.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock timeout after {timeout:?} on {target}")]
    Timeout { target: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Per-product exclusive locks
#[derive(Default)]
pub struct ProductLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl ProductLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `product_id`, waiting up to `timeout`
    pub fn acquire(&self, product_id: &str, timeout: Duration) -> LockResult<ProductGuard<'_>> {
        let start = Instant::now();
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        let mut warned = false;

        while held.contains(product_id) {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(LockError::Timeout {
                    target: product_id.to_string(),
                    timeout,
                });
            }
            if !warned && elapsed > Duration::from_millis(500) {
                tracing::warn!(product_id, "product lock contention, waiting");
                warned = true;
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, timeout - elapsed)
                .unwrap_or_else(|p| p.into_inner());
            held = guard;
        }

        held.insert(product_id.to_string());
        Ok(ProductGuard {
            locks: self,
            product_id: product_id.to_string(),
        })
    }

    /// Whether a product is currently locked
    pub fn is_locked(&self, product_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(product_id)
    }
}

/// Held product lock; released on drop
pub struct ProductGuard<'a> {
    locks: &'a ProductLocks,
    product_id: String,
}

impl ProductGuard<'_> {
    pub fn product_id(&self) -> &str {
        &self.product_id
    }
}

impl Drop for ProductGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.product_id);
        self.locks.released.notify_all();
    }
}

/// Lock mode for [`FileLock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory file lock on the store's base directory.
///
/// The lock is released when this struct is dropped.
pub struct FileLock {
    lock_path: PathBuf,
    mode: LockMode,
    #[allow(dead_code)]
    lock_file: File,
}

impl FileLock {
    /// Lock file name
    const LOCK_FILENAME: &'static str = ".custody.lock";

    /// Acquire the lock in `dir`, creating the directory and lock file if
    /// needed. Waits up to `timeout`.
    pub fn acquire(dir: &Path, mode: LockMode, timeout: Duration) -> LockResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_path = dir.join(Self::LOCK_FILENAME);
        let start = Instant::now();
        let poll_interval = Duration::from_millis(25);
        let mut warned = false;

        loop {
            match Self::try_acquire(&lock_path, mode) {
                Ok(file) => {
                    if warned {
                        tracing::info!(
                            path = %lock_path.display(),
                            waited_s = start.elapsed().as_secs_f64(),
                            "store lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path,
                        mode,
                        lock_file: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        tracing::warn!(path = %lock_path.display(), ?mode, "store lock contention, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    target: lock_path.display().to_string(),
                    timeout,
                });
            }

            std::thread::sleep(poll_interval);
        }
    }

    #[cfg(unix)]
    fn try_acquire(lock_path: &Path, mode: LockMode) -> io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(lock_path)?;

        let operation = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        let result = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };

        if result == 0 {
            Ok(file)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            } else {
                Err(err)
            }
        }
    }

    /// Non-Unix fallback: presence of the lock file means held, regardless
    /// of mode.
    #[cfg(not(unix))]
    fn try_acquire(lock_path: &Path, _mode: LockMode) -> io::Result<File> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_product_lock_excludes_same_id() {
        let locks = ProductLocks::new();
        let guard = locks.acquire("P1", Duration::from_secs(1)).unwrap();
        assert!(locks.is_locked("P1"));

        let second = locks.acquire("P1", Duration::from_millis(50));
        assert!(matches!(second, Err(LockError::Timeout { .. })));

        drop(guard);
        assert!(!locks.is_locked("P1"));
        assert!(locks.acquire("P1", Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_product_lock_independent_ids() {
        let locks = ProductLocks::new();
        let _a = locks.acquire("P1", Duration::from_secs(1)).unwrap();
        let _b = locks.acquire("P2", Duration::from_millis(50)).unwrap();
        assert!(locks.is_locked("P1") && locks.is_locked("P2"));
    }

    #[test]
    fn test_product_lock_waiter_wakes() {
        let locks = Arc::new(ProductLocks::new());
        let guard = locks.acquire("P1", Duration::from_secs(1)).unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.acquire("P1", Duration::from_secs(5)).map(|_| ()).is_ok())
        };
        thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(waiter.join().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_lock_shared_then_exclusive() {
        let dir = TempDir::new().unwrap();
        let a = FileLock::acquire(dir.path(), LockMode::Shared, Duration::from_secs(1)).unwrap();
        let b = FileLock::acquire(dir.path(), LockMode::Shared, Duration::from_secs(1)).unwrap();
        assert_eq!(a.mode(), LockMode::Shared);

        let excl = FileLock::acquire(dir.path(), LockMode::Exclusive, Duration::from_millis(100));
        assert!(matches!(excl, Err(LockError::Timeout { .. })));

        drop(a);
        drop(b);
        let excl =
            FileLock::acquire(dir.path(), LockMode::Exclusive, Duration::from_secs(1)).unwrap();
        assert!(excl.path().ends_with(".custody.lock"));
    }
}
