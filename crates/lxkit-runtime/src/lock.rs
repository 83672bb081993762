//! Per-name lock serializing lifecycle operations on one container.
//!
//! Uses an exclusive `flock(2)` on `<config_path>/.locks/<name>.lock`. The
//! lock is tied to the open file description, so it excludes other threads
//! of this process as well as other processes. Lock files live outside the
//! definition directory and are never removed, so a destroy cannot race a
//! waiter onto a stale inode.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use lxkit_common::constants::LOCK_DIR_NAME;
use lxkit_common::error::{LxkitError, Result};
use lxkit_common::types::ContainerName;
use nix::fcntl::{Flock, FlockArg};

/// Guard holding the exclusive lock of one container name.
///
/// The lock is released when the guard is dropped, or when the process
/// exits.
#[derive(Debug)]
pub struct NameLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl NameLock {
    /// Blocks until the lock for `name` under `config_path` is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be created or locked.
    pub fn acquire(config_path: &Path, name: &ContainerName) -> Result<Self> {
        Self::lock(config_path, name, FlockArg::LockExclusive)
    }

    /// Takes the lock only if nobody holds it. Returns `Ok(None)` when busy.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be created or locked.
    pub fn try_acquire(config_path: &Path, name: &ContainerName) -> Result<Option<Self>> {
        match Self::lock(config_path, name, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(lock)),
            Err(e) if e.errno() == Some(nix::errno::Errno::EWOULDBLOCK as i32) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(config_path: &Path, name: &ContainerName, arg: FlockArg) -> Result<Self> {
        let dir = config_path.join(LOCK_DIR_NAME);
        std::fs::create_dir_all(&dir).map_err(|e| LxkitError::io(&dir, e))?;

        let path = dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LxkitError::io(&path, e))?;

        let file = Flock::lock(file, arg)
            .map_err(|(_, errno)| LxkitError::io(&path, std::io::Error::from(errno)))?;
        tracing::debug!(lock_path = %path.display(), "acquired name lock");
        Ok(Self { _file: file, path })
    }
}

impl Drop for NameLock {
    fn drop(&mut self) {
        // Flock unlocks when the inner file is dropped.
        tracing::debug!(lock_path = %self.path.display(), "released name lock");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn name(s: &str) -> ContainerName {
        ContainerName::new(s).expect("valid name")
    }

    #[test]
    fn lock_file_lives_under_lock_dir() {
        let root = tempfile::tempdir().expect("tempdir");
        let lock = NameLock::acquire(root.path(), &name("web")).expect("lock");
        assert_eq!(lock.path(), root.path().join(".locks").join("web.lock"));
        assert!(lock.path().exists());
    }

    #[test]
    fn held_lock_blocks_try_acquire() {
        let root = tempfile::tempdir().expect("tempdir");
        let _held = NameLock::acquire(root.path(), &name("web")).expect("lock");
        let second = NameLock::try_acquire(root.path(), &name("web")).expect("try");
        assert!(second.is_none());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let root = tempfile::tempdir().expect("tempdir");
        drop(NameLock::acquire(root.path(), &name("web")).expect("lock"));
        let again = NameLock::try_acquire(root.path(), &name("web")).expect("try");
        assert!(again.is_some());
    }

    #[test]
    fn different_names_are_independent() {
        let root = tempfile::tempdir().expect("tempdir");
        let _a = NameLock::acquire(root.path(), &name("a")).expect("lock a");
        let b = NameLock::try_acquire(root.path(), &name("b")).expect("try b");
        assert!(b.is_some());
    }

    #[test]
    fn lock_serializes_threads() {
        let root = Arc::new(tempfile::tempdir().expect("tempdir"));
        let inside = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..6)
            .map(|_| {
                let root = Arc::clone(&root);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    let _lock = NameLock::acquire(root.path(), &name("shared")).expect("lock");
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(5));
                    let _ = inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("join");
        }
    }
}
