//! Linux native container backend using direct syscalls.
//!
//! Keeps no daemon. A launched container is described by its runtime
//! record on disk, its init process, and its cgroup; every query derives
//! the state from those three, so separate processes agree on it.

use std::fmt::Write as _;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use chrono::Utc;
use lxkit_common::config::RuntimeConfig;
use lxkit_common::constants::TEMPLATE_PREFIX;
use lxkit_common::error::{LxkitError, Result};
use lxkit_common::types::ContainerState;
use lxkit_core::cgroup::{CgroupManager, FreezerState};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sha2::{Digest, Sha256};

use super::{IsolationBackend, ProvisionRequest, StartRequest};
use crate::config::ConfigStore;
use crate::process::{ProcessSpec, spawn_container_process};
use crate::resource::{ResourceId, ResourceTable};
use crate::state::{self, RuntimeRecord};

const DEFAULT_HALT_SIGNAL: Signal = Signal::SIGPWR;

/// How long a record may stay without a pid before its launch counts as dead.
const LAUNCH_GRACE_SECS: i64 = 10;

#[derive(Debug, Clone)]
struct Target {
    name: String,
    dir: PathBuf,
    cgroup_key: String,
}

/// Backend that uses Linux kernel features directly.
///
/// Templates are executables named `lxkit-<template>`, looked up in the
/// template directory and then on `PATH`.
#[derive(Debug)]
pub struct LinuxNativeBackend {
    template_dir: PathBuf,
    cgroup_root: PathBuf,
    resources: ResourceTable<Target>,
}

impl LinuxNativeBackend {
    /// Creates a backend using the template and cgroup roots of `config`.
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            template_dir: config.template_dir.clone(),
            cgroup_root: config.cgroup_root.clone(),
            resources: ResourceTable::new(),
        }
    }

    fn cgroup(&self, target: &Target) -> CgroupManager {
        CgroupManager::open(&self.cgroup_root, &target.cgroup_key)
    }

    fn live_state(&self, target: &Target) -> Result<ContainerState> {
        let Some(record) = state::load_record(&target.dir)? else {
            return Ok(ContainerState::Stopped);
        };
        let Some(pid) = record.pid else {
            let age = Utc::now() - record.started_at;
            return Ok(if age.num_seconds() >= LAUNCH_GRACE_SECS {
                // The launching process died before recording the pid.
                ContainerState::Stopped
            } else {
                ContainerState::Starting
            });
        };
        if !process_alive(pid) {
            // The reaper has not caught up, or the process that owned it exited.
            return Ok(ContainerState::Stopped);
        }
        if record.stopping {
            return Ok(ContainerState::Stopping);
        }
        let cgroup = self.cgroup(target);
        if !cgroup.exists() {
            return Ok(ContainerState::Running);
        }
        Ok(match cgroup.freezer_state() {
            Ok(FreezerState::Frozen) => ContainerState::Frozen,
            Ok(FreezerState::Freezing) => ContainerState::Freezing,
            Ok(FreezerState::Thawing) => ContainerState::Thawed,
            Ok(FreezerState::Thawed) | Err(_) => ContainerState::Running,
        })
    }

    /// Returns the init PID of a live container or fails with `errno`.
    fn live_pid(&self, target: &Target, operation: &'static str, errno: Errno) -> Result<u32> {
        state::load_record(&target.dir)?
            .and_then(|record| record.pid)
            .filter(|pid| process_alive(*pid))
            .ok_or_else(|| os_error(operation, errno))
    }

    /// Finds the executable implementing `template`.
    fn resolve_template(&self, template: &str) -> Result<PathBuf> {
        let not_found = || LxkitError::NotFound {
            kind: "template",
            id: template.to_string(),
        };
        if template.contains('/') {
            let path = Path::new(template);
            return if path.is_absolute() && path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(not_found())
            };
        }
        let file_name = format!("{TEMPLATE_PREFIX}{template}");
        let local = self.template_dir.join(&file_name);
        if local.is_file() {
            return Ok(local);
        }
        which::which(&file_name).map_err(|_| not_found())
    }
}

impl IsolationBackend for LinuxNativeBackend {
    fn open(&self, name: &str, dir: &Path) -> Result<ResourceId> {
        Ok(self.resources.insert(Target {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            cgroup_key: cgroup_key(name, dir),
        }))
    }

    fn acquire(&self, id: ResourceId) -> Result<usize> {
        self.resources.acquire(id)
    }

    fn release(&self, id: ResourceId) -> Result<usize> {
        self.resources.release(id)
    }

    fn state(&self, id: ResourceId) -> Result<ContainerState> {
        self.live_state(&self.resources.get(id)?)
    }

    fn init_pid(&self, id: ResourceId) -> Result<Option<u32>> {
        let target = self.resources.get(id)?;
        Ok(state::load_record(&target.dir)?
            .and_then(|record| record.pid)
            .filter(|pid| process_alive(*pid)))
    }

    fn start(&self, id: ResourceId, request: &StartRequest<'_>) -> Result<()> {
        let target = self.resources.get(id)?;
        if self.live_state(&target)? != ContainerState::Stopped {
            return Err(os_error("start", Errno::EBUSY));
        }
        if !request.rootfs.is_dir() {
            return Err(os_error("start", Errno::ENOENT));
        }
        state::remove_record(&target.dir)?;

        let cgroup = CgroupManager::create(&self.cgroup_root, &target.cgroup_key)?;
        let launched = launch(&target, &cgroup, request);
        let child = match launched {
            Ok(child) => child,
            Err(e) => {
                let _ = state::remove_record(&target.dir);
                if let Err(cleanup) = cgroup.destroy() {
                    tracing::warn!(name = %target.name, error = %cleanup, "cgroup cleanup failed");
                }
                return Err(e);
            }
        };

        tracing::info!(name = %target.name, pid = child.id(), "container started");
        if request.daemonize {
            let name = target.name.clone();
            let _ = std::thread::Builder::new()
                .name(format!("lxkit-reaper-{name}"))
                .spawn(move || reap(child, &target, &cgroup))
                .map_err(|e| LxkitError::backend("spawn reaper thread", e))?;
        } else {
            reap(child, &target, &cgroup);
        }
        Ok(())
    }

    fn stop(&self, id: ResourceId) -> Result<()> {
        let target = self.resources.get(id)?;
        let pid = self.live_pid(&target, "stop", Errno::ESRCH)?;
        if let Some(mut record) = state::load_record(&target.dir)? {
            record.stopping = true;
            state::save_record(&target.dir, &record)?;
        }
        send_signal(pid, Signal::SIGKILL, "stop")?;
        // Killed tasks leave a frozen cgroup only once thawed.
        let cgroup = self.cgroup(&target);
        if cgroup.exists() {
            if let Err(e) = cgroup.thaw() {
                tracing::debug!(name = %target.name, error = %e, "thaw after kill failed");
            }
        }
        tracing::info!(name = %target.name, pid, "container killed");
        Ok(())
    }

    fn shutdown(&self, id: ResourceId, config: &ConfigStore) -> Result<()> {
        let target = self.resources.get(id)?;
        let pid = self.live_pid(&target, "shutdown", Errno::ESRCH)?;
        let signal = halt_signal(config)?;
        send_signal(pid, signal, "shutdown")?;
        tracing::info!(name = %target.name, pid, signal = %signal, "shutdown requested");
        Ok(())
    }

    fn freeze(&self, id: ResourceId) -> Result<()> {
        let target = self.resources.get(id)?;
        let _ = self.live_pid(&target, "freeze", Errno::EINVAL)?;
        self.cgroup(&target).freeze()?;
        tracing::info!(name = %target.name, "freeze requested");
        Ok(())
    }

    fn unfreeze(&self, id: ResourceId) -> Result<()> {
        let target = self.resources.get(id)?;
        let _ = self.live_pid(&target, "unfreeze", Errno::EINVAL)?;
        self.cgroup(&target).thaw()?;
        tracing::info!(name = %target.name, "thaw requested");
        Ok(())
    }

    fn provision(&self, request: &ProvisionRequest<'_>) -> Result<()> {
        let program = self.resolve_template(request.template)?;
        tracing::info!(
            name = request.name,
            template = %program.display(),
            "running template"
        );
        let status = Command::new(&program)
            .arg("--path")
            .arg(request.path)
            .arg("--name")
            .arg(request.name)
            .arg("--rootfs")
            .arg(request.rootfs)
            .args(request.args)
            .status()
            .map_err(|e| LxkitError::backend("run template", e))?;
        if !status.success() {
            return Err(LxkitError::backend(
                "run template",
                std::io::Error::other(format!("{} exited with {status}", program.display())),
            ));
        }
        Ok(())
    }

    fn destroy(&self, id: ResourceId) -> Result<()> {
        let target = self.resources.get(id)?;
        if self.live_state(&target)? != ContainerState::Stopped {
            return Err(os_error("destroy", Errno::EBUSY));
        }
        state::remove_record(&target.dir)?;
        self.cgroup(&target).destroy()
    }

    fn cgroup_item(&self, id: ResourceId, key: &str) -> Result<Vec<String>> {
        let target = self.resources.get(id)?;
        let cgroup = self.cgroup(&target);
        if !cgroup.exists() {
            return Err(os_error("read cgroup item", Errno::ENOENT));
        }
        Ok(cgroup.read_item(key)?.lines().map(str::to_string).collect())
    }

    fn set_cgroup_item(&self, id: ResourceId, key: &str, value: &str) -> Result<()> {
        let target = self.resources.get(id)?;
        let cgroup = self.cgroup(&target);
        if !cgroup.exists() {
            return Err(os_error("write cgroup item", Errno::ENOENT));
        }
        cgroup.write_item(key, value)
    }

    fn check_privilege(&self, operation: &str) -> Result<()> {
        lxkit_core::privilege::ensure_privileged(operation)
    }

    fn version(&self) -> String {
        format!("{} (native)", env!("CARGO_PKG_VERSION"))
    }
}

/// Applies cgroup settings, records the launch, and spawns the init process.
fn launch(
    target: &Target,
    cgroup: &CgroupManager,
    request: &StartRequest<'_>,
) -> Result<std::process::Child> {
    for (key, values) in request.config.iter() {
        if let (Some(file), Some(value)) = (key.strip_prefix("lxc.cgroup2."), values.last()) {
            cgroup.write_item(file, value)?;
        }
    }

    let mut record = RuntimeRecord::starting(&target.name, request.use_init);
    state::save_record(&target.dir, &record)?;

    let mut spec = ProcessSpec::from_request(&target.name, request);
    spec.cgroup_procs = Some(cgroup.path().join("cgroup.procs"));
    let child = spawn_container_process(&spec)?;

    record.pid = Some(child.id());
    if let Err(e) = state::save_record(&target.dir, &record) {
        let _ = send_signal(child.id(), Signal::SIGKILL, "start");
        return Err(e);
    }
    Ok(child)
}

/// Waits for the init process and clears what it left behind.
fn reap(mut child: std::process::Child, target: &Target, cgroup: &CgroupManager) {
    match child.wait() {
        Ok(status) => tracing::info!(name = %target.name, %status, "container exited"),
        Err(e) => tracing::warn!(name = %target.name, error = %e, "waiting for container failed"),
    }
    if let Err(e) = state::remove_record(&target.dir) {
        tracing::warn!(name = %target.name, error = %e, "runtime record cleanup failed");
    }
    if let Err(e) = cgroup.destroy() {
        tracing::warn!(name = %target.name, error = %e, "cgroup cleanup failed");
    }
}

/// Names the cgroup of the definition at `dir`. The digest of the absolute
/// directory keeps same-named containers under different roots apart.
fn cgroup_key(name: &str, dir: &Path) -> String {
    let dir = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
    let digest = Sha256::digest(dir.as_os_str().as_bytes());
    digest[..8]
        .iter()
        .fold(format!("{name}-"), |mut key, byte| {
            let _ = write!(key, "{byte:02x}");
            key
        })
}

/// Parses `lxc.haltsignal` (`SIGPWR`, `PWR`, or a number), defaulting to `SIGPWR`.
fn halt_signal(config: &ConfigStore) -> Result<Signal> {
    let Some(raw) = config.first("lxc.haltsignal") else {
        return Ok(DEFAULT_HALT_SIGNAL);
    };
    let invalid = || LxkitError::Config {
        message: format!("lxc.haltsignal: unknown signal {raw:?}"),
    };
    if let Ok(number) = raw.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| invalid());
    }
    let upper = raw.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| invalid())
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn send_signal(pid: u32, signal: Signal, operation: &'static str) -> Result<()> {
    let raw = i32::try_from(pid).map_err(|_| os_error(operation, Errno::ESRCH))?;
    signal::kill(Pid::from_raw(raw), signal).map_err(|errno| os_error(operation, errno))
}

fn os_error(operation: &'static str, errno: Errno) -> LxkitError {
    LxkitError::backend(operation, std::io::Error::from(errno))
}
