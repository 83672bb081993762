//! Cgroups v2 resource management.
//!
//! Each container gets a directory under `<root>/lxkit/<key>` in the
//! unified hierarchy, where the caller picks a key unique per definition.
//! Control files are plain files, so the manager works against any root
//! directory, which is how the tests drive it.

pub mod freezer;
pub mod memory;

use std::path::{Component, Path, PathBuf};

use lxkit_common::constants::CGROUP_PARENT;
use lxkit_common::error::{LxkitError, Result};

pub use freezer::FreezerState;

/// Handle to the cgroup of a specific container.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    /// Path to this container's cgroup directory.
    path: PathBuf,
}

impl CgroupManager {
    /// Returns a handle for the container's cgroup without touching the filesystem.
    #[must_use]
    pub fn open(root: &Path, key: &str) -> Self {
        Self {
            path: root.join(CGROUP_PARENT).join(key),
        }
    }

    /// Creates the cgroup directory for the given container key.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be created.
    pub fn create(root: &Path, key: &str) -> Result<Self> {
        let manager = Self::open(root, key);
        std::fs::create_dir_all(&manager.path).map_err(|e| LxkitError::io(&manager.path, e))?;
        tracing::info!(path = %manager.path.display(), "cgroup created");
        Ok(manager)
    }

    /// Returns the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether the cgroup directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Reads a control file and returns its trimmed content.
    ///
    /// # Errors
    ///
    /// Returns an error if the key escapes the cgroup directory or the
    /// file cannot be read.
    pub fn read_item(&self, key: &str) -> Result<String> {
        let file = self.item_path(key)?;
        let content = std::fs::read_to_string(&file).map_err(|e| LxkitError::io(&file, e))?;
        Ok(content.trim_end().to_string())
    }

    /// Writes a value to a control file.
    ///
    /// # Errors
    ///
    /// Returns an error if the key escapes the cgroup directory or the
    /// kernel rejects the value.
    pub fn write_item(&self, key: &str, value: &str) -> Result<()> {
        let file = self.item_path(key)?;
        std::fs::write(&file, value).map_err(|e| LxkitError::io(&file, e))?;
        tracing::debug!(key, value, "cgroup item written");
        Ok(())
    }

    /// Asks the kernel to suspend every task in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.freeze` cannot be written.
    pub fn freeze(&self) -> Result<()> {
        self.write_item(freezer::FREEZE_FILE, "1")
    }

    /// Asks the kernel to resume every task in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.freeze` cannot be written.
    pub fn thaw(&self) -> Result<()> {
        self.write_item(freezer::FREEZE_FILE, "0")
    }

    /// Reports the freezer state from `cgroup.freeze` and `cgroup.events`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read.
    pub fn freezer_state(&self) -> Result<FreezerState> {
        let requested = self.read_item(freezer::FREEZE_FILE)?;
        let events = self.read_item(freezer::EVENTS_FILE)?;
        Ok(FreezerState::from_files(&requested, &events))
    }

    /// Removes the cgroup. The kernel only allows this once it has no tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {}
            // A plain directory (tests, or a hierarchy that is not mounted)
            // still holds the control files we wrote.
            Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                std::fs::remove_dir_all(&self.path).map_err(|e| LxkitError::io(&self.path, e))?;
            }
            Err(e) => return Err(LxkitError::io(&self.path, e)),
        }
        tracing::info!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }

    fn item_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.path.join(relative)),
            _ => Err(LxkitError::InvalidArgument {
                message: format!("invalid cgroup item {key:?}"),
            }),
        }
    }
}
