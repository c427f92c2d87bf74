//! Process launcher and ptrace source against real processes

use std::thread;
use std::time::{Duration, Instant};

use callbench::counters::CounterSource;
use callbench::error::BenchError;
use callbench::launcher::{ProcessLauncher, TargetExit, TargetHandle};
use callbench::ptrace_source::PtraceCounterSource;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitPidFlag};
use serial_test::serial;

/// Poll `reap` until the target exits or `timeout` passes
fn wait_exit(
    launcher: &ProcessLauncher,
    handle: &mut TargetHandle,
    timeout: Duration,
) -> Option<TargetExit> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(exit) = launcher.reap(handle) {
            return Some(exit);
        }
        thread::sleep(Duration::from_millis(10));
    }
    None
}

#[test]
#[serial]
fn test_spawned_child_waits_for_release() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let launcher = ProcessLauncher::new();
    let script = format!("echo ran > {}", marker.display());

    let mut handle = launcher
        .spawn("sh", &["-c".to_string(), script])
        .unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(!marker.exists(), "target ran before release");
    assert_eq!(launcher.reap(&mut handle), None);

    launcher.release(&mut handle).unwrap();
    let exit = wait_exit(&launcher, &mut handle, Duration::from_secs(5));
    assert_eq!(exit, Some(TargetExit::Exited(0)));
    assert!(marker.exists());
}

#[test]
#[serial]
fn test_exit_status_is_reported() {
    let launcher = ProcessLauncher::new();
    let mut handle = launcher
        .spawn("sh", &["-c".to_string(), "exit 7".to_string()])
        .unwrap();
    launcher.release(&mut handle).unwrap();

    let exit = wait_exit(&launcher, &mut handle, Duration::from_secs(5));
    assert_eq!(exit, Some(TargetExit::Exited(7)));
    // Peeking leaves the status in place
    assert_eq!(launcher.reap(&mut handle), Some(TargetExit::Exited(7)));
}

#[test]
#[serial]
fn test_unreleased_child_is_reaped_on_drop() {
    let launcher = ProcessLauncher::new();
    let handle = launcher.spawn("sleep", &["30".to_string()]).unwrap();
    let pid = handle.pid().unwrap();
    assert_eq!(kill(pid, None), Ok(()));

    drop(handle);
    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
}

#[test]
#[serial]
fn test_observed_exit_is_not_killed_on_drop() {
    let launcher = ProcessLauncher::new();
    let mut handle = launcher
        .spawn("sh", &["-c".to_string(), "exit 3".to_string()])
        .unwrap();
    let pid = handle.pid().unwrap();
    launcher.release(&mut handle).unwrap();

    let exit = wait_exit(&launcher, &mut handle, Duration::from_secs(5));
    assert_eq!(exit, Some(TargetExit::Exited(3)));
    match &handle {
        TargetHandle::Spawned(child) => assert!(child.has_exited()),
        other => panic!("unexpected handle {:?}", other),
    }

    // Status collected elsewhere, as the tracer thread does; the pid is free
    waitpid(pid, Some(WaitPidFlag::__WALL)).unwrap();
    assert_eq!(kill(pid, None), Err(Errno::ESRCH));

    let started = Instant::now();
    drop(handle);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
#[serial]
fn test_release_twice_is_harmless() {
    let launcher = ProcessLauncher::new();
    let mut handle = launcher.spawn("true", &[]).unwrap();
    launcher.release(&mut handle).unwrap();
    launcher.release(&mut handle).unwrap();
    assert!(wait_exit(&launcher, &mut handle, Duration::from_secs(5)).is_some());
}

#[test]
fn test_spawn_unresolvable() {
    let launcher = ProcessLauncher::new();
    let err = launcher
        .spawn("callbench-no-such-program-xyz", &[])
        .unwrap_err();
    assert!(matches!(err, BenchError::Resolution { .. }));
}

#[test]
fn test_attach_missing_pid() {
    let launcher = ProcessLauncher::new();
    let err = launcher
        .attach(nix::unistd::Pid::from_raw(99_999_999))
        .unwrap_err();
    assert!(matches!(err, BenchError::Resolution { .. }));
}

#[test]
#[serial]
fn test_ptrace_source_counts_spawned_target() {
    let launcher = ProcessLauncher::new();
    let source = PtraceCounterSource::new();
    let mut handle = launcher
        .spawn("sh", &["-c".to_string(), "echo hi > /dev/null".to_string()])
        .unwrap();

    match source.install(&handle.scope(false)) {
        Ok(()) => {}
        // ptrace is not available in every sandbox
        Err(BenchError::Attach(reason)) if reason.contains("not permitted") => return,
        Err(e) => panic!("install failed: {}", e),
    }
    launcher.release(&mut handle).unwrap();
    assert!(wait_exit(&launcher, &mut handle, Duration::from_secs(10)).is_some());

    let snapshot = source.snapshot();
    let total: u64 = snapshot
        .values()
        .flat_map(|samples| samples.iter().map(|s| s.count))
        .sum();
    assert!(total > 0, "no calls counted");
    // The launcher's wait on the release pipe happens before exec and is not counted
    let execs = snapshot
        .get(&callbench::CallId(59))
        .map(|samples| samples.iter().map(|s| s.count).sum::<u64>())
        .unwrap_or(0);
    assert!(execs <= 1);
}
