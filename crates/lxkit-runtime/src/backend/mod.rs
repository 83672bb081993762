//! Isolation backend abstraction.
//!
//! A backend owns the kernel side of a container: its init process,
//! cgroup, and namespaces. Everything that lives on disk (definition
//! directory, configuration) is managed by the runtime itself.

pub mod linux;
pub mod simulated;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lxkit_common::config::RuntimeConfig;
use lxkit_common::error::Result;
use lxkit_common::types::ContainerState;

use crate::config::ConfigStore;
use crate::resource::ResourceId;

pub use linux::LinuxNativeBackend;
pub use simulated::SimulatedBackend;

/// Everything a backend needs to launch a container.
#[derive(Debug, Clone, Copy)]
pub struct StartRequest<'a> {
    /// Launch an init-style supervisor instead of exec'ing `args` directly.
    pub use_init: bool,
    /// Command line to run; empty means the configured init command.
    pub args: &'a [String],
    /// Return once the container is launched instead of waiting for it to exit.
    pub daemonize: bool,
    /// Configuration of the container being started.
    pub config: &'a ConfigStore,
    /// Root filesystem to run in.
    pub rootfs: &'a Path,
}

/// Inputs of a template run provisioning a new definition.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    /// Container name.
    pub name: &'a str,
    /// Template identifier.
    pub template: &'a str,
    /// Extra arguments passed through to the template.
    pub args: &'a [String],
    /// Directory the definition is being built in.
    pub path: &'a Path,
    /// Root filesystem directory the template should populate.
    pub rootfs: &'a Path,
    /// Configuration file the template may extend.
    pub config_file: &'a Path,
}

/// Kernel-side collaborator of a container handle.
///
/// Implementations must be safe to share between threads: every handle
/// created from the same backend sees the same kernel state.
pub trait IsolationBackend: Send + Sync {
    /// Allocates a resource for container `name` defined under `dir`, with
    /// one reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot track another resource.
    fn open(&self, name: &str, dir: &Path) -> Result<ResourceId>;

    /// Adds a reference to `id` and returns the new count.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` was already fully released.
    fn acquire(&self, id: ResourceId) -> Result<usize>;

    /// Drops a reference to `id` and returns the remaining count.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` was already fully released.
    fn release(&self, id: ResourceId) -> Result<usize>;

    /// Reports the live state of the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel state cannot be read.
    fn state(&self, id: ResourceId) -> Result<ContainerState>;

    /// Returns the init process PID while the container has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel state cannot be read.
    fn init_pid(&self, id: ResourceId) -> Result<Option<u32>>;

    /// Launches the container.
    ///
    /// # Errors
    ///
    /// Returns an error if kernel resources cannot be allocated.
    fn start(&self, id: ResourceId, request: &StartRequest<'_>) -> Result<()>;

    /// Kills the container without waiting for a graceful exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be signaled.
    fn stop(&self, id: ResourceId) -> Result<()>;

    /// Asks the container's init to shut down and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be delivered.
    fn shutdown(&self, id: ResourceId, config: &ConfigStore) -> Result<()>;

    /// Suspends every task of the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer cannot be driven.
    fn freeze(&self, id: ResourceId) -> Result<()>;

    /// Resumes a frozen container.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer cannot be driven.
    fn unfreeze(&self, id: ResourceId) -> Result<()>;

    /// Runs a template to populate a new definition directory.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown template, `Backend` if it fails.
    fn provision(&self, request: &ProvisionRequest<'_>) -> Result<()>;

    /// Releases kernel-side leftovers of a stopped container before its
    /// definition is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if leftovers cannot be removed.
    fn destroy(&self, id: ResourceId) -> Result<()>;

    /// Reads a cgroup control file, one value per line.
    ///
    /// # Errors
    ///
    /// Returns an error if the container has no cgroup or the file is missing.
    fn cgroup_item(&self, id: ResourceId, key: &str) -> Result<Vec<String>>;

    /// Writes a cgroup control file.
    ///
    /// # Errors
    ///
    /// Returns an error if the container has no cgroup or the kernel rejects the value.
    fn set_cgroup_item(&self, id: ResourceId, key: &str, value: &str) -> Result<()>;

    /// Returns whether `key` accumulates values in the config store.
    fn is_multi_valued(&self, key: &str) -> bool {
        crate::config::is_multi_valued_key(key)
    }

    /// Fails with `PermissionDenied` if `operation` cannot run with the
    /// current credentials.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` when the process lacks privilege.
    fn check_privilege(&self, operation: &str) -> Result<()>;

    /// Returns a version string identifying the backend.
    fn version(&self) -> String;
}

/// Creates the native backend for `config`.
#[must_use]
pub fn detect_backend(config: &RuntimeConfig) -> Arc<dyn IsolationBackend> {
    Arc::new(LinuxNativeBackend::new(config))
}

/// Resolves the root filesystem of a definition: `lxc.rootfs` if set,
/// `<dir>/rootfs` otherwise.
#[must_use]
pub fn rootfs_path(config: &ConfigStore, dir: &Path) -> PathBuf {
    config.first("lxc.rootfs").map_or_else(
        || dir.join(lxkit_common::constants::ROOTFS_DIR_NAME),
        PathBuf::from,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rootfs_defaults_to_definition_dir() {
        let config = ConfigStore::new();
        assert_eq!(
            rootfs_path(&config, Path::new("/var/lib/lxkit/web")),
            PathBuf::from("/var/lib/lxkit/web/rootfs")
        );
    }

    #[test]
    fn rootfs_follows_config() {
        let mut config = ConfigStore::new();
        config.replace("lxc.rootfs", "/srv/rootfs/web").expect("set");
        assert_eq!(
            rootfs_path(&config, Path::new("/var/lib/lxkit/web")),
            PathBuf::from("/srv/rootfs/web")
        );
    }

    #[test]
    fn detected_backend_reports_version() {
        let backend = detect_backend(&RuntimeConfig::default());
        assert!(backend.version().contains(env!("CARGO_PKG_VERSION")));
    }
}
