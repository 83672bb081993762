//! Process spawning inside isolated namespaces.
//!
//! The child joins the container cgroup, unshares its namespaces, sets the
//! hostname, and chroots into the rootfs before exec'ing the target
//! command. The hook runs between `fork(2)` and `execve(2)`, so everything
//! it needs is prepared up front and it only issues raw syscalls.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use lxkit_common::constants::DEFAULT_INIT_CMD;
use lxkit_common::error::{LxkitError, Result};
use lxkit_core::namespace::NamespaceConfig;

use crate::backend::StartRequest;
use crate::config::ConfigStore;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Fully resolved description of a container's first process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Environment of the process; nothing is inherited.
    pub env: Vec<(String, String)>,
    /// Directory the process is chrooted into.
    pub rootfs: PathBuf,
    /// Hostname set inside the new UTS namespace.
    pub hostname: Option<String>,
    /// Namespaces to unshare.
    pub namespaces: NamespaceConfig,
    /// `cgroup.procs` file the child moves itself into.
    pub cgroup_procs: Option<PathBuf>,
    /// Start a new session with stdio detached.
    pub detach: bool,
}

impl ProcessSpec {
    /// Builds the process description for a start request.
    #[must_use]
    pub fn from_request(name: &str, request: &StartRequest<'_>) -> Self {
        let config = request.config;
        Self {
            command: resolve_command(config, request.use_init, request.args),
            env: environment(config),
            rootfs: request.rootfs.to_path_buf(),
            hostname: Some(config.first("lxc.utsname").unwrap_or(name).to_string()),
            namespaces: namespaces(config),
            cgroup_procs: None,
            detach: request.daemonize,
        }
    }
}

/// Picks the command line: with `use_init` the configured init wraps
/// `args`, otherwise `args` run directly. No args means the init alone.
#[must_use]
pub fn resolve_command(config: &ConfigStore, use_init: bool, args: &[String]) -> Vec<String> {
    let init = config.first("lxc.init_cmd").unwrap_or(DEFAULT_INIT_CMD);
    if args.is_empty() {
        return init.split_whitespace().map(str::to_string).collect();
    }
    if use_init {
        init.split_whitespace()
            .map(str::to_string)
            .chain(args.iter().cloned())
            .collect()
    } else {
        args.to_vec()
    }
}

/// Collects `lxc.environment` entries (`KEY=VALUE`) on top of a default `PATH`.
#[must_use]
pub fn environment(config: &ConfigStore) -> Vec<(String, String)> {
    let mut env = vec![("PATH".to_string(), DEFAULT_PATH.to_string())];
    for entry in config.get("lxc.environment") {
        let Some((key, value)) = entry.split_once('=') else {
            tracing::warn!(entry = %entry, "ignoring environment entry without '='");
            continue;
        };
        env.retain(|(existing, _)| existing != key);
        env.push((key.to_string(), value.to_string()));
    }
    env
}

/// Derives the namespace set; a network namespace is added once any
/// interface is configured.
#[must_use]
pub fn namespaces(config: &ConfigStore) -> NamespaceConfig {
    let network = config
        .iter()
        .any(|(key, _)| key.starts_with("lxc.network.") && key.ends_with(".type"));
    NamespaceConfig {
        network,
        ..NamespaceConfig::default()
    }
}

/// Spawns the container's first process and returns its handle.
///
/// # Errors
///
/// Returns `InvalidArgument` for an empty command or paths containing NUL,
/// and `Backend` with the OS errno if fork, isolation, or exec fails.
pub fn spawn_container_process(spec: &ProcessSpec) -> Result<Child> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| LxkitError::InvalidArgument {
            message: "empty container command".into(),
        })?;

    let rootfs = path_cstring(&spec.rootfs)?;
    let cgroup_procs = spec.cgroup_procs.as_deref().map(path_cstring).transpose()?;
    let hostname = spec.hostname.clone();
    let namespaces = spec.namespaces;
    let detach = spec.detach;

    let mut cmd = Command::new(program);
    let _ = cmd.args(args).env_clear().envs(spec.env.iter().cloned());
    if detach {
        let _ = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
    }

    // SAFETY: the hook only issues async-signal-safe syscalls on data
    // prepared before the fork.
    unsafe {
        let _ = cmd.pre_exec(move || {
            if detach && libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(ref procs) = cgroup_procs {
                join_cgroup_raw(procs)?;
            }
            namespaces.unshare()?;
            if let Some(hostname) = hostname.as_deref().filter(|_| namespaces.uts) {
                lxkit_core::namespace::uts::set_hostname(hostname)?;
            }
            if libc::chroot(rootfs.as_ptr()) < 0 || libc::chdir(c"/".as_ptr()) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| LxkitError::backend("spawn container process", e))?;
    tracing::info!(
        pid = child.id(),
        program = %program,
        rootfs = %spec.rootfs.display(),
        "container process spawned"
    );
    Ok(child)
}

/// Writes `0` to `cgroup.procs`, moving the calling process into that cgroup.
fn join_cgroup_raw(procs: &CStr) -> std::io::Result<()> {
    // SAFETY: `procs` is a valid NUL-terminated path; the fd is closed on
    // every path.
    unsafe {
        let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let written = libc::write(fd, b"0".as_ptr().cast(), 1);
        let result = if written < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        };
        let _ = libc::close(fd);
        result
    }
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| LxkitError::InvalidArgument {
        message: format!("path contains a NUL byte: {}", path.display()),
    })
}
