use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use surge_core::fs::ensure_dir;
use surge_core::OrchestrationError;
use tracing::{debug, info, warn};

/// Advisory exclusive lock on a well-known path of the shared filesystem.
///
/// Guards the two windows that touch the shared skeleton (bootstrap and
/// final cache sync / cleanup). Contention blocks; it is never an error.
#[derive(Debug, Clone)]
pub struct ResourceLock {
    path: PathBuf,
}

/// Held lock; released when dropped, including during unwinding.
#[derive(Debug)]
pub struct ResourceLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to unlock resource lock");
        } else {
            debug!(path = %self.path.display(), "resource lock released");
        }
    }
}

impl ResourceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self) -> Result<ResourceLockGuard, OrchestrationError> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                info!(path = %self.path.display(), "waiting for resource lock held by another run");
                FileExt::lock_exclusive(&file)?;
            }
            Err(e) => return Err(e.into()),
        }
        debug!(path = %self.path.display(), "resource lock acquired");
        Ok(ResourceLockGuard {
            file,
            path: self.path.clone(),
        })
    }

    /// Run `body` while holding the lock. The lock is released on every exit
    /// path of `body`: normal return, error return and panic.
    pub fn with_lock<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<OrchestrationError>,
    {
        let guard = self.acquire()?;
        let result = body();
        drop(guard);
        result
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
