//! Polling wait used for asynchronous state transitions.
//!
//! The waiting thread sleeps between probes and holds no lock while it
//! sleeps, so other threads keep full access to the same container.

use std::time::{Duration, Instant};

use lxkit_common::error::Result;
use lxkit_common::types::WaitTimeout;

/// Probes `condition` until it returns `true` or `timeout` elapses.
///
/// The probe runs at least once, so [`WaitTimeout::DontWait`] is a single
/// check. Returns `Ok(false)` on timeout; errors from the probe abort the
/// wait.
///
/// # Errors
///
/// Returns the first error reported by `condition`.
pub fn poll_until(
    timeout: WaitTimeout,
    interval: Duration,
    mut condition: impl FnMut() -> Result<bool>,
) -> Result<bool> {
    let start = Instant::now();
    let deadline = timeout.deadline(start);
    loop {
        if condition()? {
            return Ok(true);
        }
        let pause = match deadline {
            None => interval,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(false);
                }
                remaining.min(interval)
            }
        };
        std::thread::sleep(pause);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use lxkit_common::error::LxkitError;

    use super::*;

    const TICK: Duration = Duration::from_millis(5);

    #[test]
    fn dont_wait_checks_exactly_once() {
        let probes = Cell::new(0);
        let start = Instant::now();
        let reached = poll_until(WaitTimeout::DontWait, Duration::from_secs(1), || {
            probes.set(probes.get() + 1);
            Ok(false)
        })
        .expect("poll");
        assert!(!reached);
        assert_eq!(probes.get(), 1);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn returns_true_once_condition_holds() {
        let probes = Cell::new(0);
        let reached = poll_until(WaitTimeout::After(Duration::from_secs(5)), TICK, || {
            probes.set(probes.get() + 1);
            Ok(probes.get() == 3)
        })
        .expect("poll");
        assert!(reached);
        assert_eq!(probes.get(), 3);
    }

    #[test]
    fn unrepresentable_deadline_waits_like_forever() {
        let probes = Cell::new(0);
        let reached = poll_until(WaitTimeout::After(Duration::MAX), TICK, || {
            probes.set(probes.get() + 1);
            Ok(probes.get() == 2)
        })
        .expect("poll");
        assert!(reached);
        assert_eq!(probes.get(), 2);
    }

    #[test]
    fn times_out_after_deadline() {
        let limit = Duration::from_millis(40);
        let start = Instant::now();
        let reached = poll_until(WaitTimeout::After(limit), TICK, || Ok(false)).expect("poll");
        assert!(!reached);
        assert!(start.elapsed() >= limit);
    }

    #[test]
    fn probe_errors_abort_the_wait() {
        let result = poll_until(WaitTimeout::Forever, TICK, || {
            Err(LxkitError::InvalidArgument {
                message: "boom".into(),
            })
        });
        assert!(result.is_err());
    }

    #[test]
    fn forever_keeps_polling_until_true() {
        let probes = Cell::new(0);
        let reached = poll_until(WaitTimeout::Forever, TICK, || {
            probes.set(probes.get() + 1);
            Ok(probes.get() >= 4)
        })
        .expect("poll");
        assert!(reached);
    }
}
