//! Concurrency tests: many threads creating, destroying, and querying
//! containers under one config root.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use lxkit_common::config::RuntimeConfig;
use lxkit_common::error::LxkitError;
use lxkit_common::types::{ContainerState, WaitTimeout};
use lxkit_runtime::{Container, IsolationBackend, Registry, SimulatedBackend, list_names};

const WORKERS: usize = 8;

fn runtime(root: &Path) -> RuntimeConfig {
    RuntimeConfig {
        poll_interval_ms: 5,
        ..RuntimeConfig::default().with_config_path(root)
    }
}

fn backend() -> Arc<dyn IsolationBackend> {
    Arc::new(SimulatedBackend::new().with_transition_delay(Duration::from_millis(10)))
}

/// Runs `job(i)` on `WORKERS` threads released together.
fn run_parallel<T, F>(job: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let job = Arc::new(job);
    let barrier = Arc::new(Barrier::new(WORKERS));
    let workers: Vec<_> = (0..WORKERS)
        .map(|i| {
            let job = Arc::clone(&job);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let _ = barrier.wait();
                job(i)
            })
        })
        .collect();
    workers
        .into_iter()
        .map(|worker| worker.join().expect("worker panicked"))
        .collect()
}

// ── Create ───────────────────────────────────────────────────────────

#[test]
fn concurrent_create_of_distinct_names() {
    let root = tempfile::tempdir().expect("tempdir");
    let rt = runtime(root.path());
    let backend = backend();

    let results = {
        let rt = rt.clone();
        let backend = Arc::clone(&backend);
        run_parallel(move |i| {
            let c = Container::open(&format!("ct-{i}"), &rt, Arc::clone(&backend))?;
            c.create("busybox", &[])
        })
    };
    assert!(results.iter().all(Result::is_ok), "{results:?}");

    let names: HashSet<String> = list_names(root.path()).expect("list").into_iter().collect();
    let expected: HashSet<String> = (0..WORKERS).map(|i| format!("ct-{i}")).collect();
    assert_eq!(names, expected);

    for name in &names {
        let c = Container::open(name, &rt, Arc::clone(&backend)).expect("open");
        assert!(c.defined());
        assert!(root.path().join(name).join("rootfs").is_dir());
    }
    let hidden = std::fs::read_dir(root.path())
        .expect("read_dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".creating-"))
        .count();
    assert_eq!(hidden, 0);
}

#[test]
fn concurrent_create_of_same_name_succeeds_once() {
    let root = tempfile::tempdir().expect("tempdir");
    let rt = runtime(root.path());
    let backend = backend();

    let results = run_parallel(move |_| {
        let c = Container::open("contended", &rt, Arc::clone(&backend))?;
        c.create("busybox", &[])
    });

    let created = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(created, 1, "{results:?}");
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LxkitError::AlreadyExists { .. }))
    );
    assert_eq!(list_names(root.path()).expect("list"), vec!["contended"]);
}

// ── Destroy ──────────────────────────────────────────────────────────

#[test]
fn concurrent_destroy_of_missing_name_is_not_found_everywhere() {
    let root = tempfile::tempdir().expect("tempdir");
    let rt = runtime(root.path());
    let backend = backend();

    let results = run_parallel(move |_| {
        let c = Container::open("never-created", &rt, Arc::clone(&backend))?;
        c.destroy()
    });
    assert!(
        results
            .iter()
            .all(|r| matches!(r, Err(LxkitError::NotFound { kind: "container", .. })))
    );
    assert!(list_names(root.path()).expect("list").is_empty());
}

#[test]
fn concurrent_destroy_of_existing_name_succeeds_once() {
    let root = tempfile::tempdir().expect("tempdir");
    let rt = runtime(root.path());
    let backend = backend();
    Container::open("doomed", &rt, Arc::clone(&backend))
        .expect("open")
        .create("busybox", &[])
        .expect("create");

    let results = run_parallel(move |_| {
        let c = Container::open("doomed", &rt, Arc::clone(&backend))?;
        c.destroy()
    });
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "{results:?}");
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LxkitError::NotFound { .. }))
    );
    assert!(list_names(root.path()).expect("list").is_empty());
}

// ── Create / Destroy ─────────────────────────────────────────────────

#[test]
fn concurrent_create_and_destroy_of_same_name_keep_definition_whole() {
    const ROUNDS: usize = 10;
    let root = tempfile::tempdir().expect("tempdir");
    let rt = runtime(root.path());
    let backend = backend();

    let unexpected = {
        let rt = rt.clone();
        let backend = Arc::clone(&backend);
        run_parallel(move |i| {
            let c = Container::open("churn", &rt, Arc::clone(&backend)).expect("open");
            (0..ROUNDS)
                .filter_map(|_| {
                    let result = if i % 2 == 0 {
                        c.create("busybox", &[])
                    } else {
                        c.destroy()
                    };
                    match result {
                        Ok(())
                        | Err(LxkitError::AlreadyExists { .. } | LxkitError::NotFound { .. }) => None,
                        Err(e) => Some(e.to_string()),
                    }
                })
                .collect::<Vec<_>>()
        })
    };
    assert!(unexpected.iter().all(Vec::is_empty), "{unexpected:?}");

    let names = list_names(root.path()).expect("list");
    assert!(names.len() <= 1, "{names:?}");
    let c = Container::open("churn", &rt, backend).expect("open");
    assert_eq!(c.defined(), names == ["churn"]);
    if c.defined() {
        assert!(root.path().join("churn").join("rootfs").is_dir());
        assert!(!c.config_item("lxc.rootfs").is_empty());
    }

    let in_flight: Vec<String> = std::fs::read_dir(root.path())
        .expect("read_dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".creating-") || name.contains(".destroying-"))
        .collect();
    assert!(in_flight.is_empty(), "{in_flight:?}");
}

// ── Queries ──────────────────────────────────────────────────────────

#[test]
fn concurrent_lifecycles_on_distinct_names() {
    let root = tempfile::tempdir().expect("tempdir");
    let rt = runtime(root.path());
    let registry = Registry::new(rt.clone(), backend());
    let backend = backend();

    let results = run_parallel(move |i| -> lxkit_common::error::Result<()> {
        let c = Container::open(&format!("life-{i}"), &rt, Arc::clone(&backend))?;
        c.create("busybox", &[])?;
        c.start(false, &[])?;
        assert!(c.wait(ContainerState::Running, WaitTimeout::from_secs(10))?);
        for _ in 0..20 {
            assert!(c.state()?.is_active());
        }
        c.stop()?;
        c.destroy()
    });
    assert!(results.iter().all(Result::is_ok), "{results:?}");
    assert!(registry.names().expect("names").is_empty());
}

#[test]
fn wait_does_not_block_other_threads() {
    let root = tempfile::tempdir().expect("tempdir");
    let rt = runtime(root.path());
    let backend = backend();
    let c = Arc::new(Container::open("shared", &rt, Arc::clone(&backend)).expect("open"));
    c.create("busybox", &[]).expect("create");

    let waiter = {
        let c = Arc::clone(&c);
        thread::spawn(move || c.wait(ContainerState::Running, WaitTimeout::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(50));
    let other = Container::open("shared", &rt, backend).expect("open");
    other.set_config_item("lxc.utsname", "probe").expect("set");
    other.start(false, &[]).expect("start");

    assert!(waiter.join().expect("join").expect("wait"));
    assert_eq!(c.state().expect("state"), ContainerState::Running);
    c.stop().expect("stop");
}
