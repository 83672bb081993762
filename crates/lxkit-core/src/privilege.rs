//! Privilege checks for lifecycle-mutating operations.
//!
//! Creating namespaces and writing cgroup files needs root. Checking up
//! front turns a confusing `EPERM` deep inside a start sequence into a
//! clear [`LxkitError::PermissionDenied`].

use lxkit_common::error::{LxkitError, Result};

/// Returns whether the process runs with an effective uid of 0.
#[cfg(unix)]
pub fn is_privileged() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Always `false` on platforms without Unix credentials.
#[cfg(not(unix))]
pub const fn is_privileged() -> bool {
    false
}

/// Fails with [`LxkitError::PermissionDenied`] unless the process is privileged.
///
/// # Errors
///
/// Returns an error when the effective uid is not 0.
pub fn ensure_privileged(operation: &str) -> Result<()> {
    if is_privileged() {
        return Ok(());
    }
    tracing::warn!(operation, "refusing privileged operation");
    Err(LxkitError::PermissionDenied {
        message: format!("{operation} requires root privileges"),
    })
}
