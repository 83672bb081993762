//! Memory accounting of running containers.
//!
//! Reads the cgroup v2 memory files through the backend so the numbers come
//! from whichever kernel model backs the container.

use lxkit_common::error::{LxkitError, Result};
use lxkit_core::cgroup::memory::{
    MEMORY_CURRENT, MEMORY_MAX, SWAP_CURRENT, SWAP_MAX, parse_bytes, parse_limit,
};
use serde::{Deserialize, Serialize};

use crate::backend::IsolationBackend;
use crate::resource::ResourceId;

/// Snapshot of a container's memory usage and limits, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Current memory usage.
    pub usage_bytes: u64,
    /// Memory limit, `None` when unlimited.
    pub limit_bytes: Option<u64>,
    /// Current swap usage.
    pub swap_usage_bytes: u64,
    /// Swap limit, `None` when unlimited.
    pub swap_limit_bytes: Option<u64>,
}

/// Collects a memory snapshot for the container behind `id`.
///
/// # Errors
///
/// Returns an error if a cgroup file cannot be read or parsed.
pub fn collect_memory(backend: &dyn IsolationBackend, id: ResourceId) -> Result<MemorySnapshot> {
    let read = |key: &str| -> Result<String> {
        backend
            .cgroup_item(id, key)?
            .into_iter()
            .next()
            .ok_or_else(|| LxkitError::Config {
                message: format!("{key}: empty cgroup file"),
            })
    };
    let snapshot = MemorySnapshot {
        usage_bytes: parse_bytes(MEMORY_CURRENT, &read(MEMORY_CURRENT)?)?,
        limit_bytes: parse_limit(MEMORY_MAX, &read(MEMORY_MAX)?)?,
        swap_usage_bytes: parse_bytes(SWAP_CURRENT, &read(SWAP_CURRENT)?)?,
        swap_limit_bytes: parse_limit(SWAP_MAX, &read(SWAP_MAX)?)?,
    };
    tracing::debug!(resource = %id, usage = snapshot.usage_bytes, "memory collected");
    Ok(snapshot)
}
