//! Container handle and lifecycle operations.
//!
//! A [`Container`] is a view of one named definition under a config root.
//! It owns a backend resource and an in-memory copy of the configuration;
//! the container state is never cached and always comes from the backend.
//! Every method takes `&self`, so one handle can be shared across threads.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use lxkit_common::config::RuntimeConfig;
use lxkit_common::constants::{CONFIG_FILE_NAME, ROOTFS_DIR_NAME};
use lxkit_common::error::{LxkitError, Result};
use lxkit_common::types::{ContainerName, ContainerState, WaitTimeout};

use crate::backend::{self, IsolationBackend, ProvisionRequest, StartRequest};
use crate::config::ConfigStore;
use crate::lock::NameLock;
use crate::metrics::{self, MemorySnapshot};
use crate::resource::Resource;
use crate::wait;

/// How long `stop` waits for the backend to report the container stopped.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// The most recent failure observed by one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Operation that failed.
    pub operation: &'static str,
    /// Human-readable description.
    pub message: String,
    /// OS errno reported by the backend, when there is one.
    pub errno: Option<i32>,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)?;
        if let Some(errno) = self.errno {
            write!(f, " (errno {errno})")?;
        }
        Ok(())
    }
}

/// Handle to one named container.
#[derive(Debug)]
pub struct Container {
    name: ContainerName,
    runtime: RuntimeConfig,
    resource: Resource,
    config: RwLock<ConfigStore>,
    daemonize: AtomicBool,
    last_error: Mutex<Option<ErrorRecord>>,
}

impl Container {
    /// Opens `name` under the environment's config root with the native backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or an existing definition
    /// cannot be loaded.
    pub fn new(name: &str) -> Result<Self> {
        let runtime = RuntimeConfig::from_env();
        let backend = backend::detect_backend(&runtime);
        Self::open(name, &runtime, backend)
    }

    /// Opens `name` under `runtime.config_path` using `backend`.
    ///
    /// The handle may refer to a container that is not defined yet. If the
    /// definition exists its configuration is loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the backend cannot open a
    /// resource, or an existing configuration file is malformed.
    pub fn open(
        name: &str,
        runtime: &RuntimeConfig,
        backend: Arc<dyn IsolationBackend>,
    ) -> Result<Self> {
        let name = ContainerName::new(name)?;
        let dir = runtime.config_path.join(name.as_str());
        let resource = Resource::open(backend, name.as_str(), &dir)?;
        let config = load_definition(&dir)?;
        tracing::debug!(name = %name, path = %dir.display(), "container handle opened");
        Ok(Self {
            name,
            runtime: runtime.clone(),
            resource,
            config: RwLock::new(config),
            daemonize: AtomicBool::new(true),
            last_error: Mutex::new(None),
        })
    }

    /// Returns the container name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the config root this handle resolves the definition against.
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.runtime.config_path
    }

    /// Moves the handle to another config root, re-opening the backend
    /// resource and reloading the definition found there.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot open a resource or the
    /// definition at the new root is malformed. The handle is unchanged
    /// on error.
    pub fn set_config_path(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let (resource, config) = self.record("set config path", self.open_at(&path))?;
        self.resource = resource;
        *self.config.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner) = config;
        tracing::debug!(name = %self.name, path = %path.display(), "config path changed");
        self.runtime.config_path = path;
        Ok(())
    }

    /// Returns the path of the container's configuration file.
    #[must_use]
    pub fn config_file_name(&self) -> PathBuf {
        self.dir().join(CONFIG_FILE_NAME)
    }

    /// Returns whether the container has an on-disk definition.
    #[must_use]
    pub fn defined(&self) -> bool {
        self.config_file_name().is_file()
    }

    /// Queries the live state from the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report the state.
    pub fn state(&self) -> Result<ContainerState> {
        self.record("state", self.backend().state(self.resource.id()))
    }

    /// Returns whether the container is in any state other than stopped.
    #[must_use]
    pub fn running(&self) -> bool {
        self.state().is_ok_and(ContainerState::is_active)
    }

    /// Returns the PID of the container's init process, if it has one.
    #[must_use]
    pub fn init_pid(&self) -> Option<u32> {
        self.record("init pid", self.backend().init_pid(self.resource.id()))
            .ok()
            .flatten()
    }

    /// Returns whether `start` detaches from the container.
    #[must_use]
    pub fn daemonize(&self) -> bool {
        self.daemonize.load(Ordering::Relaxed)
    }

    /// Sets whether `start` detaches (`true`, the default) or blocks until
    /// the container exits.
    pub fn set_daemonize(&self, daemonize: bool) {
        self.daemonize.store(daemonize, Ordering::Relaxed);
    }

    /// Returns the most recent failure recorded by this handle.
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Provisions a new definition by running `template` with `args`.
    ///
    /// The definition is assembled in a hidden staging directory and
    /// renamed into place, so it is either complete or absent. The current
    /// in-memory configuration is the starting point the template extends.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is defined, `NotFound` for an
    /// unknown template, `PermissionDenied` without privilege, `Backend`
    /// if the template fails, and `Io` if an undefined directory occupies
    /// the name.
    pub fn create(&self, template: &str, args: &[String]) -> Result<()> {
        self.record("create", self.create_definition(template, args))
    }

    fn create_definition(&self, template: &str, args: &[String]) -> Result<()> {
        self.backend().check_privilege("create")?;
        if template.is_empty() {
            return Err(LxkitError::InvalidArgument {
                message: "template name is empty".into(),
            });
        }
        let root = self.config_path();
        std::fs::create_dir_all(root).map_err(|e| LxkitError::io(root, e))?;
        let _lock = NameLock::acquire(root, &self.name)?;
        if self.defined() {
            return Err(self.already_exists());
        }

        let staging = StagingDir::create(
            root.join(format!(".{}.creating-{}", self.name, uuid::Uuid::new_v4())),
        )?;
        let staged_config = staging.path().join(CONFIG_FILE_NAME);
        self.read_config().save(&staged_config)?;

        let staged_rootfs = staging.path().join(ROOTFS_DIR_NAME);
        self.backend().provision(&ProvisionRequest {
            name: self.name(),
            template,
            args,
            path: staging.path(),
            rootfs: &staged_rootfs,
            config_file: &staged_config,
        })?;

        let dir = self.dir();
        let mut config = ConfigStore::load(&staged_config)?;
        config.rewrite_prefix(
            &staging.path().to_string_lossy(),
            &dir.to_string_lossy(),
        );
        if config.first("lxc.rootfs").is_none() {
            config.replace("lxc.rootfs", &dir.join(ROOTFS_DIR_NAME).to_string_lossy())?;
        }
        config.save(&staged_config)?;

        // Under the lock with no config file, anything at `dir` is a stray
        // directory rather than a definition.
        std::fs::rename(staging.path(), &dir).map_err(|e| LxkitError::io(&dir, e))?;
        staging.keep();

        *self.write_config() = config;
        tracing::info!(name = %self.name, template, path = %dir.display(), "container created");
        Ok(())
    }

    /// Launches the container. `use_init` runs the configured init as a
    /// supervisor around `args`; empty `args` runs the init alone.
    ///
    /// Returns once the backend has accepted the launch (use [`Self::wait`]
    /// to observe `RUNNING`), or after the container exits when
    /// daemonize is off. A failed start leaves the container stopped.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the container is not defined, `InvalidState`
    /// unless it is stopped, and `Backend` with the OS errno if kernel
    /// resources cannot be allocated.
    pub fn start(&self, use_init: bool, args: &[String]) -> Result<()> {
        self.record("start", self.start_container(use_init, args))
    }

    fn start_container(&self, use_init: bool, args: &[String]) -> Result<()> {
        self.backend().check_privilege("start")?;
        let _lock = NameLock::acquire(self.config_path(), &self.name)?;
        self.ensure_defined()?;
        self.require_state("start", |state| state == ContainerState::Stopped)?;

        let config = self.read_config().clone();
        let rootfs = backend::rootfs_path(&config, &self.dir());
        let request = StartRequest {
            use_init,
            args,
            daemonize: self.daemonize(),
            config: &config,
            rootfs: &rootfs,
        };
        let id = self.resource.id();
        if let Err(e) = self.backend().start(id, &request) {
            if self.backend().state(id).is_ok_and(ContainerState::is_active) {
                if let Err(cleanup) = self.backend().stop(id) {
                    tracing::warn!(name = %self.name, error = %cleanup, "stop after failed start failed");
                }
            }
            return Err(e);
        }
        tracing::info!(name = %self.name, use_init, "container start requested");
        Ok(())
    }

    /// Kills the container without waiting for a graceful exit, then waits
    /// for the backend to report it stopped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if it is already stopped, `Backend` if it
    /// cannot be killed, and `Timeout` if it does not stop in time.
    pub fn stop(&self) -> Result<()> {
        self.record("stop", self.stop_container())
    }

    fn stop_container(&self) -> Result<()> {
        self.backend().check_privilege("stop")?;
        self.require_state("stop", |state| state != ContainerState::Stopped)?;
        self.backend().stop(self.resource.id())?;
        self.await_state(ContainerState::Stopped, WaitTimeout::After(STOP_TIMEOUT))?;
        tracing::info!(name = %self.name, "container stopped");
        Ok(())
    }

    /// Asks the container to shut down and waits for it to stop.
    ///
    /// [`WaitTimeout::DontWait`] only delivers the request and checks once.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if it is already stopped, `Backend` if the
    /// request cannot be delivered, and `Timeout` if the container is still
    /// up when `timeout` elapses.
    pub fn shutdown(&self, timeout: WaitTimeout) -> Result<()> {
        self.record("shutdown", self.shutdown_container(timeout))
    }

    fn shutdown_container(&self, timeout: WaitTimeout) -> Result<()> {
        self.backend().check_privilege("shutdown")?;
        self.require_state("shut down", |state| state != ContainerState::Stopped)?;
        let config = self.read_config().clone();
        self.backend().shutdown(self.resource.id(), &config)?;
        self.await_state(ContainerState::Stopped, timeout)?;
        tracing::info!(name = %self.name, "container shut down");
        Ok(())
    }

    /// Suspends a running container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the container is running.
    pub fn freeze(&self) -> Result<()> {
        self.record("freeze", self.freeze_container())
    }

    fn freeze_container(&self) -> Result<()> {
        self.backend().check_privilege("freeze")?;
        self.require_state("freeze", |state| state == ContainerState::Running)?;
        self.backend().freeze(self.resource.id())?;
        tracing::info!(name = %self.name, "container freeze requested");
        Ok(())
    }

    /// Resumes a frozen container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the container is frozen.
    pub fn unfreeze(&self) -> Result<()> {
        self.record("unfreeze", self.unfreeze_container())
    }

    fn unfreeze_container(&self) -> Result<()> {
        self.backend().check_privilege("unfreeze")?;
        self.require_state("unfreeze", |state| state == ContainerState::Frozen)?;
        self.backend().unfreeze(self.resource.id())?;
        tracing::info!(name = %self.name, "container thaw requested");
        Ok(())
    }

    /// Removes the on-disk definition of a stopped container.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the container is not defined and
    /// `InvalidState` unless it is stopped.
    pub fn destroy(&self) -> Result<()> {
        self.record("destroy", self.destroy_definition())
    }

    fn destroy_definition(&self) -> Result<()> {
        self.backend().check_privilege("destroy")?;
        let root = self.config_path();
        std::fs::create_dir_all(root).map_err(|e| LxkitError::io(root, e))?;
        let _lock = NameLock::acquire(root, &self.name)?;
        self.ensure_defined()?;
        self.require_state("destroy", |state| state == ContainerState::Stopped)?;
        self.backend().destroy(self.resource.id())?;

        let dir = self.dir();
        let doomed = root.join(format!(".{}.destroying-{}", self.name, uuid::Uuid::new_v4()));
        std::fs::rename(&dir, &doomed).map_err(|e| LxkitError::io(&dir, e))?;
        if let Err(e) = std::fs::remove_dir_all(&doomed) {
            tracing::warn!(path = %doomed.display(), error = %e, "failed to remove destroyed definition");
        }
        *self.write_config() = ConfigStore::new();
        tracing::info!(name = %self.name, "container destroyed");
        Ok(())
    }

    /// Blocks until the container reaches `target` or `timeout` elapses.
    ///
    /// Holds no lock while waiting. Returns `Ok(false)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report the state.
    pub fn wait(&self, target: ContainerState, timeout: WaitTimeout) -> Result<bool> {
        let id = self.resource.id();
        let reached = wait::poll_until(timeout, self.runtime.poll_interval(), || {
            Ok(self.backend().state(id)? == target)
        });
        self.record("wait", reached)
    }

    /// Returns every value of `key`, empty when unset.
    #[must_use]
    pub fn config_item(&self, key: &str) -> Vec<String> {
        self.read_config().get(key).to_vec()
    }

    /// Sets `key`. Multi-valued keys get `value` appended; other keys are
    /// replaced. An empty value clears the key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a malformed key or value.
    pub fn set_config_item(&self, key: &str, value: &str) -> Result<()> {
        let multi_valued = self.backend().is_multi_valued(key);
        let result = self.write_config().set(key, value, multi_valued);
        tracing::debug!(name = %self.name, key, multi_valued, "config item set");
        self.record("set config item", result)
    }

    /// Removes every value of `key`.
    pub fn clear_config_item(&self, key: &str) {
        let removed = self.write_config().clear(key);
        tracing::debug!(name = %self.name, key, removed, "config item cleared");
    }

    /// Lists the immediate child segments of `prefix`.
    #[must_use]
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.read_config().keys(prefix)
    }

    /// Replaces the in-memory configuration with the file at `path`.
    ///
    /// `path` is resolved to an absolute path that must name an existing
    /// file. The configuration is only replaced if the file parses.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file does not exist and `Config` if it is
    /// malformed.
    pub fn load_config_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.record("load config file", self.load_config(path.as_ref()))
    }

    fn load_config(&self, path: &Path) -> Result<()> {
        let absolute = std::path::absolute(path).map_err(|e| LxkitError::io(path, e))?;
        if !absolute.is_file() {
            return Err(LxkitError::NotFound {
                kind: "config file",
                id: absolute.display().to_string(),
            });
        }
        let config = ConfigStore::load(&absolute)?;
        *self.write_config() = config;
        tracing::debug!(name = %self.name, path = %absolute.display(), "config file loaded");
        Ok(())
    }

    /// Writes the in-memory configuration to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_config_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.record("save config file", self.save_config(path.as_ref()))
    }

    fn save_config(&self, path: &Path) -> Result<()> {
        let root = self.config_path();
        std::fs::create_dir_all(root).map_err(|e| LxkitError::io(root, e))?;
        let _lock = NameLock::acquire(root, &self.name)?;
        let config = self.read_config().clone();
        config.save(path)
    }

    /// Reads a cgroup control file of the running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container has no cgroup or the file is missing.
    pub fn cgroup_item(&self, key: &str) -> Result<Vec<String>> {
        self.record(
            "cgroup item",
            self.backend().cgroup_item(self.resource.id(), key),
        )
    }

    /// Writes a cgroup control file of the running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container has no cgroup or the kernel
    /// rejects the value.
    pub fn set_cgroup_item(&self, key: &str, value: &str) -> Result<()> {
        let result = self
            .backend()
            .check_privilege("set cgroup item")
            .and_then(|()| self.backend().set_cgroup_item(self.resource.id(), key, value));
        self.record("set cgroup item", result)
    }

    /// Counts the network interfaces (`lxc.network.<n>`) configured.
    #[must_use]
    pub fn number_of_network_interfaces(&self) -> usize {
        self.keys("lxc.network")
            .iter()
            .filter(|index| index.bytes().all(|b| b.is_ascii_digit()))
            .count()
    }

    /// Reads memory and swap usage and limits from the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is not running or a value cannot
    /// be parsed.
    pub fn memory_snapshot(&self) -> Result<MemorySnapshot> {
        self.record(
            "memory snapshot",
            metrics::collect_memory(self.backend().as_ref(), self.resource.id()),
        )
    }

    /// Returns a second handle sharing this handle's backend resource.
    ///
    /// The clone starts with a copy of the configuration and no recorded
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend no longer knows the resource.
    pub fn try_clone(&self) -> Result<Self> {
        let resource = self.record("clone", self.resource.share())?;
        Ok(Self {
            name: self.name.clone(),
            runtime: self.runtime.clone(),
            resource,
            config: RwLock::new(self.read_config().clone()),
            daemonize: AtomicBool::new(self.daemonize()),
            last_error: Mutex::new(None),
        })
    }

    /// Opens a fresh resource and loads the definition under another root.
    fn open_at(&self, root: &Path) -> Result<(Resource, ConfigStore)> {
        let dir = root.join(self.name.as_str());
        let resource = Resource::open(Arc::clone(self.backend()), self.name(), &dir)?;
        let config = load_definition(&dir)?;
        Ok((resource, config))
    }

    fn backend(&self) -> &Arc<dyn IsolationBackend> {
        self.resource.backend()
    }

    fn dir(&self) -> PathBuf {
        self.config_path().join(self.name.as_str())
    }

    fn read_config(&self) -> RwLockReadGuard<'_, ConfigStore> {
        self.config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_config(&self) -> RwLockWriteGuard<'_, ConfigStore> {
        self.config
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn already_exists(&self) -> LxkitError {
        LxkitError::AlreadyExists {
            name: self.name.to_string(),
        }
    }

    fn ensure_defined(&self) -> Result<()> {
        if self.defined() {
            Ok(())
        } else {
            Err(LxkitError::NotFound {
                kind: "container",
                id: self.name.to_string(),
            })
        }
    }

    /// Fails with `InvalidState` unless the live state satisfies `allowed`.
    fn require_state(
        &self,
        operation: &'static str,
        allowed: impl Fn(ContainerState) -> bool,
    ) -> Result<()> {
        let state = self.backend().state(self.resource.id())?;
        if allowed(state) {
            Ok(())
        } else {
            Err(LxkitError::InvalidState {
                name: self.name.to_string(),
                state,
                operation,
            })
        }
    }

    /// Waits for `target`, turning an elapsed deadline into `Timeout`.
    fn await_state(&self, target: ContainerState, timeout: WaitTimeout) -> Result<()> {
        let started = Instant::now();
        let id = self.resource.id();
        let reached = wait::poll_until(timeout, self.runtime.poll_interval(), || {
            Ok(self.backend().state(id)? == target)
        })?;
        if reached {
            Ok(())
        } else {
            Err(LxkitError::Timeout {
                name: self.name.to_string(),
                target,
                waited: started.elapsed(),
            })
        }
    }

    /// Remembers a failure of `operation` before handing the result back.
    fn record<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::debug!(name = %self.name, operation, error = %e, "operation failed");
            *self
                .last_error
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(ErrorRecord {
                operation,
                message: e.to_string(),
                errno: e.errno(),
            });
        }
        result
    }
}

/// Loads the definition in `dir`, or an empty store if there is none.
fn load_definition(dir: &Path) -> Result<ConfigStore> {
    let file = dir.join(CONFIG_FILE_NAME);
    if file.is_file() {
        ConfigStore::load(&file)
    } else {
        Ok(ConfigStore::new())
    }
}

/// Staging directory removed on drop unless kept.
#[derive(Debug)]
struct StagingDir {
    path: PathBuf,
    keep: bool,
}

impl StagingDir {
    fn create(path: PathBuf) -> Result<Self> {
        std::fs::create_dir(&path).map_err(|e| LxkitError::io(&path, e))?;
        Ok(Self { path, keep: false })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staging directory");
        }
    }
}
