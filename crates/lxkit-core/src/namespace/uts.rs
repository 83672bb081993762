//! UTS namespace isolation.
//!
//! Allows the container to have its own hostname.

/// Sets the hostname inside the current UTS namespace.
///
/// # Errors
///
/// Returns the OS error if `sethostname(2)` fails.
#[cfg(target_os = "linux")]
pub fn set_hostname(hostname: &str) -> std::io::Result<()> {
    nix::unistd::sethostname(hostname).map_err(std::io::Error::from)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error, UTS namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_hostname(_hostname: &str) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}
