//! In-process isolation backend.
//!
//! Models the kernel side of containers in memory so the full lifecycle
//! runs without privilege. Transient states resolve to their successor
//! once the configured delay has passed, evaluated lazily whenever the
//! state is observed. Kernel state is keyed by definition directory and
//! shared by every handle opened on the same backend instance.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lxkit_common::error::{LxkitError, Result};
use lxkit_common::types::ContainerState;
use lxkit_core::cgroup::memory::{MEMORY_CURRENT, MEMORY_MAX, SWAP_CURRENT, SWAP_MAX};

use super::{IsolationBackend, ProvisionRequest, StartRequest};
use crate::config::ConfigStore;
use crate::resource::{ResourceId, ResourceTable};

/// Template run by [`SimulatedBackend::provision`].
pub type TemplateFn = Arc<dyn Fn(&ProvisionRequest<'_>) -> std::io::Result<()> + Send + Sync>;

const DEFAULT_TRANSITION_DELAY: Duration = Duration::from_millis(20);
const FIRST_PID: u32 = 1000;

#[derive(Debug, Clone)]
struct Target {
    name: String,
    dir: PathBuf,
}

#[derive(Debug, Clone)]
struct Kernel {
    state: ContainerState,
    since: Instant,
    pid: Option<u32>,
    cgroup: BTreeMap<String, String>,
}

impl Kernel {
    fn stopped() -> Self {
        Self {
            state: ContainerState::Stopped,
            since: Instant::now(),
            pid: None,
            cgroup: BTreeMap::new(),
        }
    }

    fn enter(&mut self, state: ContainerState) {
        self.state = state;
        self.since = Instant::now();
    }

    /// Moves a transient state to its successor once `delay` has elapsed.
    fn settle(&mut self, delay: Duration) {
        if !self.state.is_transient() || self.since.elapsed() < delay {
            return;
        }
        let next = match self.state {
            ContainerState::Starting | ContainerState::Thawed => ContainerState::Running,
            ContainerState::Freezing => ContainerState::Frozen,
            _ => ContainerState::Stopped,
        };
        self.enter(next);
        if next == ContainerState::Stopped {
            self.pid = None;
            self.cgroup.clear();
        }
    }
}

/// Backend keeping container kernel state in memory.
pub struct SimulatedBackend {
    resources: ResourceTable<Target>,
    kernels: Mutex<HashMap<PathBuf, Kernel>>,
    templates: HashMap<String, TemplateFn>,
    next_pid: AtomicU32,
    privileged: bool,
    ignore_shutdown: bool,
    transition_delay: Duration,
}

impl SimulatedBackend {
    /// Creates a privileged backend with the `busybox` and `none` templates.
    #[must_use]
    pub fn new() -> Self {
        let mut templates: HashMap<String, TemplateFn> = HashMap::new();
        let _ = templates.insert("busybox".into(), Arc::new(busybox_template));
        let _ = templates.insert("none".into(), Arc::new(empty_template));
        Self {
            resources: ResourceTable::new(),
            kernels: Mutex::new(HashMap::new()),
            templates,
            next_pid: AtomicU32::new(FIRST_PID),
            privileged: true,
            ignore_shutdown: false,
            transition_delay: DEFAULT_TRANSITION_DELAY,
        }
    }

    /// Sets whether privileged operations are allowed.
    #[must_use]
    pub const fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Makes containers ignore graceful shutdown requests.
    #[must_use]
    pub const fn with_ignore_shutdown(mut self, ignore: bool) -> Self {
        self.ignore_shutdown = ignore;
        self
    }

    /// Sets how long transient states last.
    #[must_use]
    pub const fn with_transition_delay(mut self, delay: Duration) -> Self {
        self.transition_delay = delay;
        self
    }

    /// Registers (or replaces) a named template.
    #[must_use]
    pub fn with_template<F>(mut self, name: &str, template: F) -> Self
    where
        F: Fn(&ProvisionRequest<'_>) -> std::io::Result<()> + Send + Sync + 'static,
    {
        let _ = self.templates.insert(name.to_string(), Arc::new(template));
        self
    }

    /// Returns the number of live backend resources.
    #[must_use]
    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    fn kernels(&self) -> MutexGuard<'_, HashMap<PathBuf, Kernel>> {
        self.kernels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Runs `f` on the settled kernel state of `id`.
    fn with_kernel<R>(&self, id: ResourceId, f: impl FnOnce(&Target, &mut Kernel) -> R) -> Result<R> {
        let target = self.resources.get(id)?;
        let mut kernels = self.kernels();
        let kernel = kernels
            .entry(target.dir.clone())
            .or_insert_with(Kernel::stopped);
        kernel.settle(self.transition_delay);
        Ok(f(&target, kernel))
    }

    /// Moves `id` from `from` to `to`, or fails with `EINVAL`.
    fn transition(
        &self,
        id: ResourceId,
        operation: &'static str,
        from: &[ContainerState],
        to: ContainerState,
    ) -> Result<()> {
        self.with_kernel(id, |target, kernel| {
            if !from.contains(&kernel.state) {
                return Err(os_error(operation, libc::EINVAL));
            }
            kernel.enter(to);
            tracing::info!(name = %target.name, state = %to, "simulated transition");
            Ok(())
        })?
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut templates: Vec<_> = self.templates.keys().collect();
        templates.sort();
        f.debug_struct("SimulatedBackend")
            .field("templates", &templates)
            .field("privileged", &self.privileged)
            .field("ignore_shutdown", &self.ignore_shutdown)
            .field("transition_delay", &self.transition_delay)
            .finish_non_exhaustive()
    }
}

impl IsolationBackend for SimulatedBackend {
    fn open(&self, name: &str, dir: &Path) -> Result<ResourceId> {
        Ok(self.resources.insert(Target {
            name: name.to_string(),
            dir: dir.to_path_buf(),
        }))
    }

    fn acquire(&self, id: ResourceId) -> Result<usize> {
        self.resources.acquire(id)
    }

    fn release(&self, id: ResourceId) -> Result<usize> {
        self.resources.release(id)
    }

    fn state(&self, id: ResourceId) -> Result<ContainerState> {
        self.with_kernel(id, |_, kernel| kernel.state)
    }

    fn init_pid(&self, id: ResourceId) -> Result<Option<u32>> {
        self.with_kernel(id, |_, kernel| kernel.pid)
    }

    fn start(&self, id: ResourceId, request: &StartRequest<'_>) -> Result<()> {
        if !request.rootfs.is_dir() {
            return Err(os_error("start", libc::ENOENT));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        self.with_kernel(id, |target, kernel| {
            if kernel.state != ContainerState::Stopped {
                return Err(os_error("start", libc::EBUSY));
            }
            kernel.cgroup = default_cgroup(pid);
            for (key, values) in request.config.iter() {
                if let (Some(file), Some(value)) = (key.strip_prefix("lxc.cgroup2."), values.last()) {
                    let _ = kernel.cgroup.insert(file.to_string(), value.clone());
                }
            }
            kernel.pid = Some(pid);
            kernel.enter(ContainerState::Starting);
            tracing::info!(name = %target.name, pid, "simulated container starting");
            Ok(())
        })?
    }

    fn stop(&self, id: ResourceId) -> Result<()> {
        self.with_kernel(id, |target, kernel| {
            if kernel.state == ContainerState::Stopped {
                return Err(os_error("stop", libc::ESRCH));
            }
            kernel.enter(ContainerState::Stopping);
            tracing::info!(name = %target.name, "simulated container stopping");
            Ok(())
        })?
    }

    fn shutdown(&self, id: ResourceId, _config: &ConfigStore) -> Result<()> {
        if self.ignore_shutdown {
            return self.with_kernel(id, |target, kernel| {
                tracing::debug!(name = %target.name, state = %kernel.state, "shutdown request ignored");
            });
        }
        self.stop(id)
    }

    fn freeze(&self, id: ResourceId) -> Result<()> {
        self.transition(id, "freeze", &[ContainerState::Running], ContainerState::Freezing)
    }

    fn unfreeze(&self, id: ResourceId) -> Result<()> {
        self.transition(id, "unfreeze", &[ContainerState::Frozen], ContainerState::Thawed)
    }

    fn provision(&self, request: &ProvisionRequest<'_>) -> Result<()> {
        let template = self
            .templates
            .get(request.template)
            .ok_or_else(|| LxkitError::NotFound {
                kind: "template",
                id: request.template.to_string(),
            })?;
        template(request).map_err(|e| LxkitError::backend("run template", e))?;
        tracing::info!(name = request.name, template = request.template, "simulated template ran");
        Ok(())
    }

    fn destroy(&self, id: ResourceId) -> Result<()> {
        let target = self.resources.get(id)?;
        let mut kernels = self.kernels();
        if let Some(kernel) = kernels.get_mut(&target.dir) {
            kernel.settle(self.transition_delay);
            if kernel.state != ContainerState::Stopped {
                return Err(os_error("destroy", libc::EBUSY));
            }
        }
        let _ = kernels.remove(&target.dir);
        Ok(())
    }

    fn cgroup_item(&self, id: ResourceId, key: &str) -> Result<Vec<String>> {
        self.with_kernel(id, |_, kernel| {
            if !kernel.state.is_active() {
                return Err(os_error("read cgroup item", libc::ENOENT));
            }
            kernel
                .cgroup
                .get(key)
                .map(|value| value.lines().map(str::to_string).collect())
                .ok_or_else(|| os_error("read cgroup item", libc::ENOENT))
        })?
    }

    fn set_cgroup_item(&self, id: ResourceId, key: &str, value: &str) -> Result<()> {
        self.with_kernel(id, |_, kernel| {
            if !kernel.state.is_active() {
                return Err(os_error("write cgroup item", libc::ENOENT));
            }
            let _ = kernel.cgroup.insert(key.to_string(), value.to_string());
            Ok(())
        })?
    }

    fn check_privilege(&self, operation: &str) -> Result<()> {
        if self.privileged {
            Ok(())
        } else {
            Err(LxkitError::PermissionDenied {
                message: format!("{operation} requires root privileges"),
            })
        }
    }

    fn version(&self) -> String {
        format!("{} (simulated)", env!("CARGO_PKG_VERSION"))
    }
}

fn os_error(operation: &'static str, errno: i32) -> LxkitError {
    LxkitError::backend(operation, std::io::Error::from_raw_os_error(errno))
}

fn default_cgroup(pid: u32) -> BTreeMap<String, String> {
    [
        ("cgroup.procs", pid.to_string()),
        (MEMORY_CURRENT, "4194304".to_string()),
        (MEMORY_MAX, "max".to_string()),
        (SWAP_CURRENT, "0".to_string()),
        (SWAP_MAX, "max".to_string()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

fn empty_template(req: &ProvisionRequest<'_>) -> std::io::Result<()> {
    std::fs::create_dir_all(req.rootfs)
}

/// Lays out a minimal rootfs and records hostname, rootfs, and one
/// network interface in the config file.
fn busybox_template(req: &ProvisionRequest<'_>) -> std::io::Result<()> {
    for dir in ["bin", "dev", "etc", "proc", "sys", "tmp"] {
        std::fs::create_dir_all(req.rootfs.join(dir))?;
    }
    std::fs::write(req.rootfs.join("etc/hostname"), format!("{}\n", req.name))?;
    let mut config = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(req.config_file)?;
    writeln!(config, "lxc.utsname = {}", req.name)?;
    writeln!(config, "lxc.rootfs = {}", req.rootfs.display())?;
    writeln!(config, "lxc.network.0.type = veth")?;
    writeln!(config, "lxc.network.0.link = lxcbr0")?;
    writeln!(config, "lxc.network.0.mtu = 1500")?;
    Ok(())
}
