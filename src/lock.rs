//! Advisory lock files serializing package installation across processes.
//!
//! Waiting for a lock held by another build is polled, never failed, and
//! emits a warning once contention lasts long enough to be noticeable. The
//! lock is released when the guard is dropped.

use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock timeout after {0:?} on {1}")]
    Timeout(Duration, Utf8PathBuf),

    #[error("I/O error on lock {1}: {0}")]
    Io(#[source] io::Error, Utf8PathBuf),
}

/// Held advisory lock.
#[derive(Debug)]
pub struct FileLock {
    path: Utf8PathBuf,
    file: File,
}

impl FileLock {
    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    const WARN_AFTER: Duration = Duration::from_millis(500);

    /// Acquires the lock file `<dir>/<name>.lock`, creating `dir` if needed.
    /// Waits indefinitely unless `timeout` is given.
    pub async fn acquire(
        dir: &Utf8Path,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, LockError> {
        let path = dir.join(format!("{name}.lock"));
        let file = {
            let (dir, path) = (dir.to_owned(), path.clone());
            tokio::task::spawn_blocking(move || open_lock_file(&dir, &path))
                .await
                .map_err(io::Error::other)
                .and_then(|opened| opened)
        }
        .map_err(|e| LockError::Io(e, path.clone()))?;

        let start = Instant::now();
        let mut warned = false;

        loop {
            match file.try_lock() {
                Ok(()) => {
                    if warned {
                        tracing::info!(
                            "lock acquired after {:.1}s: {path}",
                            start.elapsed().as_secs_f64()
                        );
                    }
                    return Ok(Self { path, file });
                }
                Err(TryLockError::WouldBlock) => {
                    if !warned && start.elapsed() > Self::WARN_AFTER {
                        tracing::warn!("waiting for lock held by another build: {path}");
                        warned = true;
                    }
                }
                Err(TryLockError::Error(e)) => return Err(LockError::Io(e, path)),
            }

            if let Some(timeout) = timeout
                && start.elapsed() >= timeout
            {
                return Err(LockError::Timeout(timeout, path));
            }

            tokio::time::sleep(Self::POLL_INTERVAL).await;
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

fn open_lock_file(dir: &Utf8Path, path: &Utf8Path) -> io::Result<File> {
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("failed to release lock {}: {e}", self.path);
        }
    }
}
