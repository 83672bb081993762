//! Linux namespace management for container isolation.
//!
//! The functions here run in the forked child between `fork(2)` and
//! `execve(2)`, so they neither allocate nor log. Callers log around them.

pub mod uts;

/// Which namespaces a container process gets.
///
/// A PID namespace is not listed: `unshare(CLONE_NEWPID)` only applies to
/// children of the caller, and the container init is exec'd in place.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate the mount table.
    pub mount: bool,
    /// Isolate hostname and domain name.
    pub uts: bool,
    /// Isolate System V IPC and POSIX message queues.
    pub ipc: bool,
    /// Isolate the network stack.
    pub network: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            mount: true,
            uts: true,
            ipc: true,
            network: false,
        }
    }
}

#[cfg(target_os = "linux")]
impl NamespaceConfig {
    /// Returns the `unshare(2)` flags for this configuration.
    #[must_use]
    pub fn clone_flags(&self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        let mut flags = CloneFlags::empty();
        flags.set(CloneFlags::CLONE_NEWNS, self.mount);
        flags.set(CloneFlags::CLONE_NEWUTS, self.uts);
        flags.set(CloneFlags::CLONE_NEWIPC, self.ipc);
        flags.set(CloneFlags::CLONE_NEWNET, self.network);
        flags
    }

    /// Moves the calling process into fresh namespaces.
    ///
    /// # Errors
    ///
    /// Returns the OS error if `unshare(2)` fails.
    pub fn unshare(&self) -> std::io::Result<()> {
        let flags = self.clone_flags();
        if flags.is_empty() {
            return Ok(());
        }
        nix::sched::unshare(flags).map_err(std::io::Error::from)
    }
}

#[cfg(not(target_os = "linux"))]
impl NamespaceConfig {
    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error, namespaces require Linux.
    pub fn unshare(&self) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}
