//! Domain primitive types used across the lxkit workspace.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{LxkitError, Result};

/// Validated container name.
///
/// A name is one path component under the config root. Leading dots are
/// reserved for staging and lock entries kept next to the definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerName(String);

impl ContainerName {
    /// Validates and wraps a container name.
    ///
    /// # Errors
    ///
    /// Returns [`LxkitError::InvalidArgument`] if the name is empty, starts
    /// with a dot, or contains `/` or NUL.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("must not be empty")
        } else if name.starts_with('.') {
            Some("must not start with '.'")
        } else if name.contains('/') {
            Some("must not contain '/'")
        } else if name.contains('\0') {
            Some("must not contain NUL")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(LxkitError::InvalidArgument {
                message: format!("container name {name:?} {reason}"),
            }),
            None => Ok(Self(name)),
        }
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContainerName {
    type Error = LxkitError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ContainerName> for String {
    fn from(name: ContainerName) -> Self {
        name.0
    }
}

impl AsRef<str> for ContainerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a container as reported by the isolation backend.
///
/// The runtime never infers this value itself; it is always queried live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    /// No kernel resources exist for the container.
    Stopped,
    /// The init process is being launched.
    Starting,
    /// The init process is running.
    Running,
    /// The container is being torn down.
    Stopping,
    /// A start attempt is being rolled back.
    Aborting,
    /// The cgroup freezer is suspending the container's tasks.
    Freezing,
    /// All tasks are suspended.
    Frozen,
    /// Tasks are being resumed after a freeze.
    Thawed,
    /// The backend reported a state this runtime does not know.
    Unknown,
}

impl ContainerState {
    /// All states the backend can report, in backend order.
    pub const ALL: [Self; 8] = [
        Self::Stopped,
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Aborting,
        Self::Freezing,
        Self::Frozen,
        Self::Thawed,
    ];

    /// Returns the canonical upper-case name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Aborting => "ABORTING",
            Self::Freezing => "FREEZING",
            Self::Frozen => "FROZEN",
            Self::Thawed => "THAWED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Maps an external state name onto the enumeration.
    ///
    /// Matching is case-insensitive. Anything unrecognized maps to
    /// [`ContainerState::Unknown`].
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(name))
            .unwrap_or(Self::Unknown)
    }

    /// Returns whether the backend alone decides when this state resolves.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Stopping | Self::Aborting | Self::Freezing | Self::Thawed
        )
    }

    /// Returns whether kernel resources exist for the container.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Stopped | Self::Unknown)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a blocking call waits for a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Block until the transition happens.
    Forever,
    /// Check once and return immediately.
    DontWait,
    /// Block for at most the given wall-clock duration.
    After(Duration),
}

impl WaitTimeout {
    /// Converts a seconds count: negative waits forever, zero does not wait.
    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        match u64::try_from(secs) {
            Err(_) => Self::Forever,
            Ok(0) => Self::DontWait,
            Ok(secs) => Self::After(Duration::from_secs(secs)),
        }
    }

    /// Returns the deadline relative to `start`.
    ///
    /// `None` means no deadline: [`WaitTimeout::Forever`], or a limit too
    /// far in the future for the clock to represent.
    #[must_use]
    pub fn deadline(self, start: Instant) -> Option<Instant> {
        match self {
            Self::Forever => None,
            Self::DontWait => Some(start),
            Self::After(limit) => start.checked_add(limit),
        }
    }
}

impl From<Duration> for WaitTimeout {
    fn from(limit: Duration) -> Self {
        if limit.is_zero() {
            Self::DontWait
        } else {
            Self::After(limit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for state in ContainerState::ALL {
            assert_eq!(ContainerState::from_name(state.as_str()), state);
        }
    }

    #[test]
    fn unknown_state_names_do_not_default() {
        assert_eq!(ContainerState::from_name("EXPLODED"), ContainerState::Unknown);
        assert_eq!(ContainerState::from_name(""), ContainerState::Unknown);
        assert_eq!(ContainerState::from_name("frozen"), ContainerState::Frozen);
    }

    #[test]
    fn huge_timeouts_have_no_deadline() {
        let now = Instant::now();
        let timeout = WaitTimeout::from_secs(i64::MAX);
        assert!(matches!(timeout, WaitTimeout::After(_)));
        assert_eq!(timeout.deadline(now), None);
        assert_eq!(WaitTimeout::After(Duration::MAX).deadline(now), None);
        assert_eq!(
            WaitTimeout::from_secs(5).deadline(now),
            Some(now + Duration::from_secs(5))
        );
    }

    #[test]
    fn transient_states() {
        assert!(ContainerState::Starting.is_transient());
        assert!(ContainerState::Thawed.is_transient());
        assert!(!ContainerState::Frozen.is_transient());
        assert!(!ContainerState::Stopped.is_active());
        assert!(ContainerState::Frozen.is_active());
    }

    #[test]
    fn timeout_from_secs() {
        assert_eq!(WaitTimeout::from_secs(-1), WaitTimeout::Forever);
        assert_eq!(WaitTimeout::from_secs(0), WaitTimeout::DontWait);
        assert_eq!(
            WaitTimeout::from_secs(30),
            WaitTimeout::After(Duration::from_secs(30))
        );
    }

    #[test]
    fn dont_wait_deadline_is_now() {
        let now = Instant::now();
        assert_eq!(WaitTimeout::DontWait.deadline(now), Some(now));
        assert_eq!(WaitTimeout::Forever.deadline(now), None);
    }

    #[test]
    fn container_name_validation() {
        assert!(ContainerName::new("rubik").is_ok());
        assert!(ContainerName::new("web-01_a").is_ok());
        assert!(ContainerName::new("").is_err());
        assert!(ContainerName::new("..").is_err());
        assert!(ContainerName::new(".hidden").is_err());
        assert!(ContainerName::new("a/b").is_err());
        assert!(ContainerName::new("nul\0").is_err());
    }
}
