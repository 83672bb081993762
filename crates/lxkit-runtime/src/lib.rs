//! # lxkit-runtime
//!
//! Container lifecycle management on top of an isolation backend.
//!
//! A [`Container`] handle creates, starts, stops, freezes, and destroys one
//! named container defined under a config root, and edits its key/value
//! configuration. The kernel side is delegated to an [`IsolationBackend`]:
//! [`LinuxNativeBackend`] drives namespaces and cgroups directly, while
//! [`SimulatedBackend`] models them in memory.
//!
//! ```no_run
//! use lxkit_common::types::{ContainerState, WaitTimeout};
//! use lxkit_runtime::Container;
//!
//! # fn main() -> lxkit_common::error::Result<()> {
//! let web = Container::new("web")?;
//! web.create("busybox", &[])?;
//! web.start(false, &[])?;
//! assert!(web.wait(ContainerState::Running, WaitTimeout::from_secs(30))?);
//! web.stop()?;
//! web.destroy()?;
//! # Ok(())
//! # }
//! ```

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod config;
pub mod container;
pub mod lock;
pub mod metrics;
pub mod process;
pub mod registry;
pub mod resource;
pub mod state;
pub mod wait;

pub use backend::{IsolationBackend, LinuxNativeBackend, SimulatedBackend, detect_backend};
pub use config::ConfigStore;
pub use container::{Container, ErrorRecord};
pub use lxkit_common::constants::default_config_path;
pub use metrics::MemorySnapshot;
pub use registry::{Registry, list_containers, list_names};

/// Returns the version of this library.
#[must_use]
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
