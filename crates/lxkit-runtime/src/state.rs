//! Persistent runtime record of a launched container.
//!
//! The native backend keeps no daemon: what it knows about a running
//! container lives in `<dir>/runtime.json`, next to the definition, so any
//! process opening the same container sees the same init PID.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lxkit_common::constants::RUNTIME_FILE_NAME;
use lxkit_common::error::{LxkitError, Result};
use serde::{Deserialize, Serialize};

/// What the native backend remembers about a launched container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    /// Container name.
    pub name: String,
    /// PID of the init process; `None` while the launch is in flight.
    pub pid: Option<u32>,
    /// When the start request was accepted.
    pub started_at: DateTime<Utc>,
    /// Whether an init supervisor was launched.
    pub use_init: bool,
    /// Set once a stop or shutdown request was delivered.
    #[serde(default)]
    pub stopping: bool,
}

impl RuntimeRecord {
    /// Creates the record of a launch that has not produced a PID yet.
    #[must_use]
    pub fn starting(name: &str, use_init: bool) -> Self {
        Self {
            name: name.to_string(),
            pid: None,
            started_at: Utc::now(),
            use_init,
            stopping: false,
        }
    }
}

/// Returns the record file of the definition in `dir`.
#[must_use]
pub fn record_path(dir: &Path) -> PathBuf {
    dir.join(RUNTIME_FILE_NAME)
}

/// Loads the record in `dir`, or `None` if the container was never started
/// or has been reaped.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_record(dir: &Path) -> Result<Option<RuntimeRecord>> {
    let path = record_path(dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LxkitError::io(&path, e)),
    };
    Ok(Some(serde_json::from_str(&content)?))
}

/// Persists `record` in `dir` atomically.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_record(dir: &Path, record: &RuntimeRecord) -> Result<()> {
    let path = record_path(dir);
    let tmp = dir.join(format!(".{RUNTIME_FILE_NAME}.{}.tmp", uuid::Uuid::new_v4()));
    let content = serde_json::to_string_pretty(record)?;
    std::fs::write(&tmp, content).map_err(|e| LxkitError::io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        LxkitError::io(&path, e)
    })?;
    tracing::debug!(path = %path.display(), pid = ?record.pid, "runtime record saved");
    Ok(())
}

/// Removes the record in `dir`. A missing record is not an error.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be removed.
pub fn remove_record(dir: &Path) -> Result<()> {
    let path = record_path(dir);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "runtime record removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LxkitError::io(&path, e)),
    }
}
