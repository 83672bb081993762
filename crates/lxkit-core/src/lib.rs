//! # lxkit-core
//!
//! Low-level Linux isolation primitives used by the native backend of the
//! lxkit runtime.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups v2**: per-container cgroup directories, the freezer, and
//!   raw control-file access.
//! - **Namespaces**: mount, UTS, IPC, and network isolation via `unshare(2)`.
//! - **Privilege**: the fallible check run before lifecycle operations.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod namespace;
pub mod privilege;
