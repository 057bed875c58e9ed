use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::Error;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cross-process advisory lock on a dedicated lock file. Lock files are left
/// on disk after release so every process locks the same inode; the OS drops
/// the lock itself if the holder crashes.
#[derive(Debug)]
pub struct FileLock {
    file: std::fs::File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock is held, polling up to `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<FileLock, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(FileLock {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout(path.to_path_buf()));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // the lock file stays; only the flock is released
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("x.lock");
        {
            let _lock = FileLock::acquire(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
            assert!(path.exists());
        }
        // released on drop; immediately reacquirable, file still present
        let _again = FileLock::acquire(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let held = FileLock::acquire(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
        let err = FileLock::acquire(&path, Duration::from_millis(120)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        drop(held);
        let _ok = FileLock::acquire(&path, Duration::from_millis(120)).unwrap();
    }
}
