//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Default root under which container definitions live.
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/lxkit";

/// Default directory searched for provisioning templates.
pub const DEFAULT_TEMPLATE_DIR: &str = "/usr/share/lxkit/templates";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Environment variable overriding the config root.
pub const CONFIG_PATH_ENV: &str = "LXKIT_PATH";

/// Environment variable overriding the template directory.
pub const TEMPLATE_DIR_ENV: &str = "LXKIT_TEMPLATE_DIR";

/// Environment variable overriding the cgroup mount point.
pub const CGROUP_ROOT_ENV: &str = "LXKIT_CGROUP_ROOT";

/// Environment variable overriding the wait polling period in milliseconds.
pub const POLL_INTERVAL_ENV: &str = "LXKIT_POLL_INTERVAL_MS";

/// Name of the definition file inside a container directory.
pub const CONFIG_FILE_NAME: &str = "config";

/// Name of the root filesystem directory inside a container directory.
pub const ROOTFS_DIR_NAME: &str = "rootfs";

/// Name of the runtime record written by the native backend.
pub const RUNTIME_FILE_NAME: &str = "runtime.json";

/// Directory under the config root holding per-name lock files.
pub const LOCK_DIR_NAME: &str = ".locks";

/// Prefix of template executables.
pub const TEMPLATE_PREFIX: &str = "lxkit-";

/// Cgroup sub-directory under which container cgroups are created.
pub const CGROUP_PARENT: &str = "lxkit";

/// Default polling period for state waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Command launched when a container is started without arguments.
pub const DEFAULT_INIT_CMD: &str = "/sbin/init";

fn resolve_config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .filter(|value| !value.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

static CONFIG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Returns the process-wide default config root, resolved once.
pub fn default_config_path() -> &'static PathBuf {
    CONFIG_PATH.get_or_init(resolve_config_path)
}
