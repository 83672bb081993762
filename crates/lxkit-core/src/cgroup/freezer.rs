//! Cgroup v2 freezer state.

/// Control file requesting a freeze (`1`) or thaw (`0`).
pub const FREEZE_FILE: &str = "cgroup.freeze";

/// Control file reporting whether the freeze has completed.
pub const EVENTS_FILE: &str = "cgroup.events";

/// Combined view of the requested and effective freezer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FreezerState {
    /// Tasks are running.
    Thawed,
    /// A freeze was requested and not every task is suspended yet.
    Freezing,
    /// Every task is suspended.
    Frozen,
    /// A thaw was requested while the kernel still reports the cgroup frozen.
    Thawing,
}

impl FreezerState {
    /// Derives the state from the contents of `cgroup.freeze` and `cgroup.events`.
    #[must_use]
    pub fn from_files(freeze: &str, events: &str) -> Self {
        let requested = freeze.trim() == "1";
        let frozen = events
            .lines()
            .filter_map(|line| line.split_once(' '))
            .any(|(key, value)| key == "frozen" && value.trim() == "1");
        match (requested, frozen) {
            (true, true) => Self::Frozen,
            (true, false) => Self::Freezing,
            (false, true) => Self::Thawing,
            (false, false) => Self::Thawed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_combination() {
        assert_eq!(FreezerState::from_files("0\n", "frozen 0\n"), FreezerState::Thawed);
        assert_eq!(FreezerState::from_files("1\n", "frozen 0\n"), FreezerState::Freezing);
        assert_eq!(FreezerState::from_files("1\n", "populated 1\nfrozen 1\n"), FreezerState::Frozen);
        assert_eq!(FreezerState::from_files("0", "frozen 1"), FreezerState::Thawing);
    }

    #[test]
    fn missing_frozen_line_means_not_frozen() {
        assert_eq!(FreezerState::from_files("1", "populated 1"), FreezerState::Freezing);
    }
}
