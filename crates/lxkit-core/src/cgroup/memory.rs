//! Memory accounting files of cgroups v2.
//!
//! Manages `memory.current`, `memory.max`, and their swap counterparts.

use lxkit_common::error::{LxkitError, Result};

/// Current memory usage in bytes.
pub const MEMORY_CURRENT: &str = "memory.current";
/// Hard memory limit in bytes, or `max`.
pub const MEMORY_MAX: &str = "memory.max";
/// Current swap usage in bytes.
pub const SWAP_CURRENT: &str = "memory.swap.current";
/// Hard swap limit in bytes, or `max`.
pub const SWAP_MAX: &str = "memory.swap.max";

/// Parses a byte counter such as `memory.current`.
///
/// # Errors
///
/// Returns an error if the value is not an unsigned integer.
pub fn parse_bytes(key: &str, raw: &str) -> Result<u64> {
    raw.trim().parse().map_err(|_| LxkitError::Config {
        message: format!("{key}: expected a byte count, got {raw:?}"),
    })
}

/// Parses a limit such as `memory.max`. `max` yields `None` (unlimited).
///
/// # Errors
///
/// Returns an error if the value is neither `max` nor an unsigned integer.
pub fn parse_limit(key: &str, raw: &str) -> Result<Option<u64>> {
    if raw.trim() == "max" {
        return Ok(None);
    }
    parse_bytes(key, raw).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_accept_max() {
        assert_eq!(parse_limit(MEMORY_MAX, "max\n").expect("max"), None);
        assert_eq!(parse_limit(MEMORY_MAX, "1048576").expect("bytes"), Some(1_048_576));
    }

    #[test]
    fn counters_reject_garbage() {
        assert_eq!(parse_bytes(MEMORY_CURRENT, " 42 ").expect("bytes"), 42);
        assert!(parse_bytes(MEMORY_CURRENT, "max").is_err());
        assert!(parse_limit(SWAP_MAX, "-1").is_err());
    }
}
