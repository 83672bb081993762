//! Runtime configuration model.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{LxkitError, Result};

/// Settings shared by every container handle created from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory holding one definition directory per container.
    pub config_path: PathBuf,
    /// Directory searched for `lxkit-<template>` executables.
    pub template_dir: PathBuf,
    /// Mount point of the cgroup v2 hierarchy.
    pub cgroup_root: PathBuf,
    /// Polling period used while waiting for state transitions.
    pub poll_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            config_path: constants::default_config_path().clone(),
            template_dir: PathBuf::from(constants::DEFAULT_TEMPLATE_DIR),
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            poll_interval_ms: millis(constants::DEFAULT_POLL_INTERVAL),
        }
    }
}

impl RuntimeConfig {
    /// Builds the defaults overlaid with `LXKIT_*` environment variables.
    ///
    /// Unparsable numeric values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Loads a JSON configuration file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| LxkitError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Returns a copy rooted at a different config path.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    /// Returns the polling period as a [`Duration`], never zero.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn overlay(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| var(key).filter(|value| !value.is_empty());
        if let Some(path) = lookup(constants::CONFIG_PATH_ENV) {
            self.config_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup(constants::TEMPLATE_DIR_ENV) {
            self.template_dir = PathBuf::from(dir);
        }
        if let Some(root) = lookup(constants::CGROUP_ROOT_ENV) {
            self.cgroup_root = PathBuf::from(root);
        }
        if let Some(raw) = lookup(constants::POLL_INTERVAL_ENV) {
            match raw.parse() {
                Ok(ms) => self.poll_interval_ms = ms,
                Err(_) => tracing::warn!(
                    var = constants::POLL_INTERVAL_ENV,
                    value = %raw,
                    "ignoring unparsable poll interval"
                ),
            }
        }
        self
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_point_at_system_paths() {
        let config = RuntimeConfig::default();
        assert_eq!(config.template_dir, PathBuf::from(constants::DEFAULT_TEMPLATE_DIR));
        assert_eq!(config.cgroup_root, PathBuf::from(constants::CGROUP_V2_PATH));
        assert_eq!(config.poll_interval(), constants::DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn overlay_applies_environment_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (constants::CONFIG_PATH_ENV, "/srv/containers"),
            (constants::POLL_INTERVAL_ENV, "25"),
            (constants::TEMPLATE_DIR_ENV, ""),
        ]);
        let config =
            RuntimeConfig::default().overlay(|key| vars.get(key).map(ToString::to_string));
        assert_eq!(config.config_path, PathBuf::from("/srv/containers"));
        assert_eq!(config.poll_interval(), Duration::from_millis(25));
        assert_eq!(config.template_dir, PathBuf::from(constants::DEFAULT_TEMPLATE_DIR));
    }

    #[test]
    fn overlay_ignores_bad_poll_interval() {
        let config = RuntimeConfig::default().overlay(|key| {
            (key == constants::POLL_INTERVAL_ENV).then(|| "soon".to_string())
        });
        assert_eq!(config.poll_interval(), constants::DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let config = RuntimeConfig {
            poll_interval_ms: 0,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lxkit.json");
        std::fs::write(&path, r#"{ "config_path": "/tmp/lx", "poll_interval_ms": 10 }"#)
            .expect("write");
        let config = RuntimeConfig::load(&path).expect("load");
        assert_eq!(config.config_path, PathBuf::from("/tmp/lx"));
        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.cgroup_root, PathBuf::from(constants::CGROUP_V2_PATH));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/lxkit.json")).unwrap_err();
        assert!(matches!(err, LxkitError::Io { .. }));
    }
}
