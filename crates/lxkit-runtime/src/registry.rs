//! Enumeration of the containers defined under a config root.
//!
//! A directory counts as a definition when it holds a config file. Hidden
//! entries (lock directory, staging and destroying directories) are never
//! listed, so a half-created or half-destroyed container is invisible.

use std::path::Path;
use std::sync::Arc;

use lxkit_common::config::RuntimeConfig;
use lxkit_common::constants::CONFIG_FILE_NAME;
use lxkit_common::error::{LxkitError, Result};

use crate::backend::{self, IsolationBackend};
use crate::container::Container;

/// Lists the names of the containers defined under `config_path`, in
/// directory order. A missing root holds no containers.
///
/// # Errors
///
/// Returns an error if the root or one of its entries cannot be read; no
/// partial list is returned.
pub fn list_names(config_path: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(config_path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LxkitError::io(config_path, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LxkitError::io(config_path, e))?;
        let Ok(name) = entry.file_name().into_string() else {
            tracing::debug!(path = %entry.path().display(), "skipping non UTF-8 entry");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() && path.join(CONFIG_FILE_NAME).is_file() {
            names.push(name);
        }
    }
    Ok(names)
}

/// Opens a handle for every container defined under `runtime.config_path`.
///
/// # Errors
///
/// Returns an error if listing fails or any definition cannot be opened;
/// no partial list is returned.
pub fn list_containers(
    runtime: &RuntimeConfig,
    backend: &Arc<dyn IsolationBackend>,
) -> Result<Vec<Container>> {
    list_names(&runtime.config_path)?
        .iter()
        .map(|name| Container::open(name, runtime, Arc::clone(backend)))
        .collect()
}

/// Entry point for enumerating and opening containers under one root.
#[derive(Clone)]
pub struct Registry {
    runtime: RuntimeConfig,
    backend: Arc<dyn IsolationBackend>,
}

impl Registry {
    /// Creates a registry over `runtime.config_path` using `backend`.
    #[must_use]
    pub fn new(runtime: RuntimeConfig, backend: Arc<dyn IsolationBackend>) -> Self {
        Self { runtime, backend }
    }

    /// Creates a registry from the environment with the native backend.
    #[must_use]
    pub fn from_env() -> Self {
        let runtime = RuntimeConfig::from_env();
        let backend = backend::detect_backend(&runtime);
        Self::new(runtime, backend)
    }

    /// Returns the runtime configuration.
    #[must_use]
    pub const fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Lists defined container names.
    ///
    /// # Errors
    ///
    /// Returns an error if the config root cannot be read.
    pub fn names(&self) -> Result<Vec<String>> {
        list_names(&self.runtime.config_path)
    }

    /// Opens a handle for every defined container.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or opening fails.
    pub fn containers(&self) -> Result<Vec<Container>> {
        list_containers(&self.runtime, &self.backend)
    }

    /// Opens the defined container `name`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such container is defined.
    pub fn container(&self, name: &str) -> Result<Container> {
        let container = Container::open(name, &self.runtime, Arc::clone(&self.backend))?;
        if !container.defined() {
            return Err(LxkitError::NotFound {
                kind: "container",
                id: name.to_string(),
            });
        }
        Ok(container)
    }

    /// Lists defined containers whose state is not `STOPPED`.
    ///
    /// # Errors
    ///
    /// Returns an error if listing fails or a state cannot be queried.
    pub fn active_names(&self) -> Result<Vec<String>> {
        let mut active = Vec::new();
        for container in self.containers()? {
            if container.state()?.is_active() {
                active.push(container.name().to_string());
            }
        }
        Ok(active)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config_path", &self.runtime.config_path)
            .field("backend", &self.backend.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::backend::SimulatedBackend;

    use super::*;

    fn registry(root: &Path) -> Registry {
        Registry::new(
            RuntimeConfig::default().with_config_path(root),
            Arc::new(SimulatedBackend::new().with_transition_delay(Duration::ZERO)),
        )
    }

    #[test]
    fn missing_root_lists_nothing() {
        let root = tempfile::tempdir().expect("tempdir");
        assert!(list_names(&root.path().join("absent")).expect("list").is_empty());
    }

    #[test]
    fn only_directories_with_config_are_listed() {
        let root = tempfile::tempdir().expect("tempdir");
        for dir in ["web", "db", "empty", ".web.creating-1", ".locks"] {
            std::fs::create_dir_all(root.path().join(dir)).expect("mkdir");
        }
        for dir in ["web", "db", ".web.creating-1"] {
            std::fs::write(root.path().join(dir).join("config"), "").expect("write");
        }
        std::fs::write(root.path().join("stray"), "").expect("write");

        let mut names = list_names(root.path()).expect("list");
        names.sort();
        assert_eq!(names, vec!["db", "web"]);
    }

    #[test]
    fn container_requires_definition() {
        let root = tempfile::tempdir().expect("tempdir");
        let registry = registry(root.path());
        assert!(matches!(
            registry.container("ghost"),
            Err(LxkitError::NotFound { kind: "container", .. })
        ));
    }

    #[test]
    fn active_names_skip_stopped() {
        let root = tempfile::tempdir().expect("tempdir");
        let registry = registry(root.path());
        for name in ["a", "b"] {
            let c = Container::open(name, registry.runtime(), Arc::clone(&registry.backend))
                .expect("open");
            c.create("busybox", &[]).expect("create");
        }
        let a = registry.container("a").expect("a");
        a.start(false, &[]).expect("start");

        assert_eq!(registry.active_names().expect("active"), vec!["a"]);
        assert_eq!(registry.containers().expect("containers").len(), 2);
        a.stop().expect("stop");
        assert!(registry.active_names().expect("active").is_empty());
    }
}
