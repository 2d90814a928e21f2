//! Process-level tests for the receiver registry
//!
//! Real child processes are started from small shell scripts standing in for
//! the UxPlay binary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;
use uxmirror_registry::{ProcessRegistry, RegistryError};

const SHORT: Duration = Duration::from_secs(2);

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A receiver that runs until terminated
fn sleeper(dir: &TempDir) -> String {
    write_script(dir.path(), "uxplay", "exec sleep 30")
        .to_string_lossy()
        .into_owned()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn test_start_reports_running_and_pid() {
    let dir = tempfile::tempdir().unwrap();
    let binary = sleeper(&dir);
    let registry = ProcessRegistry::new();

    let pid = registry.start("ipad", &binary, "iPadMirror", 7000, &[]).unwrap();
    assert!(pid > 0);
    assert!(registry.is_running("ipad"));
    assert_eq!(registry.get_pid("ipad"), Some(pid));
    assert!(!registry.is_running("iphone"));

    assert!(registry.stop("ipad", SHORT));
}

#[test]
fn test_second_start_is_already_running() {
    let dir = tempfile::tempdir().unwrap();
    let binary = sleeper(&dir);
    let registry = ProcessRegistry::new();

    let pid = registry.start("ipad", &binary, "iPadMirror", 7000, &[]).unwrap();
    let err = registry
        .start("ipad", &binary, "iPadMirror", 7000, &[])
        .unwrap_err();
    match err {
        RegistryError::AlreadyRunning { label, pid: existing } => {
            assert_eq!(label, "ipad");
            assert_eq!(existing, pid);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(registry.running_count(), 1);
    assert_eq!(registry.get_pid("ipad"), Some(pid));
    assert!(registry.stop("ipad", SHORT));
}

#[test]
fn test_stop_clears_state() {
    let dir = tempfile::tempdir().unwrap();
    let binary = sleeper(&dir);
    let registry = ProcessRegistry::new();

    let pid = registry.start("iphone", &binary, "iPhoneMirror", 7100, &[]).unwrap();
    assert!(registry.stop("iphone", SHORT));
    assert!(!registry.is_running("iphone"));
    assert_eq!(registry.get_pid("iphone"), None);
    assert!(registry.status("iphone").is_none());

    // the process is gone and already reaped
    assert!(kill(Pid::from_raw(pid as i32), None).is_err());

    // nothing left to stop
    assert!(!registry.stop("iphone", SHORT));
}

#[test]
fn test_external_kill_is_observed() {
    let dir = tempfile::tempdir().unwrap();
    let binary = sleeper(&dir);
    let registry = ProcessRegistry::new();

    let pid = registry.start("ipad", &binary, "iPadMirror", 7000, &[]).unwrap();
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    assert!(wait_until(SHORT, || !registry.is_running("ipad")));
    assert_eq!(registry.get_pid("ipad"), None);
    assert!(!registry.stop("ipad", SHORT));

    // the label is free again
    let new_pid = registry.start("ipad", &binary, "iPadMirror", 7000, &[]).unwrap();
    assert_eq!(registry.get_pid("ipad"), Some(new_pid));
    assert!(registry.stop("ipad", SHORT));
}

#[test]
fn test_start_replaces_exited_record() {
    let dir = tempfile::tempdir().unwrap();
    let quick = write_script(dir.path(), "quick", "exit 0");
    let binary = sleeper(&dir);
    let registry = ProcessRegistry::new();

    registry
        .start("ipad", quick.to_str().unwrap(), "iPadMirror", 7000, &[])
        .unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let pid = registry.start("ipad", &binary, "iPadMirror", 7000, &[]).unwrap();
    assert_eq!(registry.get_pid("ipad"), Some(pid));
    assert!(registry.stop("ipad", SHORT));
}

#[test]
fn test_stop_all_counts_live_receivers() {
    let dir = tempfile::tempdir().unwrap();
    let binary = sleeper(&dir);
    let quick = write_script(dir.path(), "quick", "exit 0");
    let registry = ProcessRegistry::new();

    registry.start("ipad", &binary, "iPadMirror", 7000, &[]).unwrap();
    registry.start("iphone", &binary, "iPhoneMirror", 7100, &[]).unwrap();
    registry
        .start("ghost", quick.to_str().unwrap(), "Ghost", 7200, &[])
        .unwrap();
    // let the quick one exit without anybody looking at it
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(registry.stop_all(SHORT), 2);
    for label in ["ipad", "iphone", "ghost"] {
        assert!(!registry.is_running(label), "{label} still running");
    }
    assert_eq!(registry.stop_all(SHORT), 0);
}

#[test]
fn test_stubborn_receiver_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("ready");
    let stubborn = write_script(
        dir.path(),
        "stubborn",
        &format!(
            "trap '' TERM\ntouch '{}'\nwhile :; do sleep 1; done",
            ready.display()
        ),
    );
    let registry = ProcessRegistry::new();

    registry
        .start("ipad", stubborn.to_str().unwrap(), "iPadMirror", 7000, &[])
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || ready.exists()));

    let timeout = Duration::from_millis(300);
    let began = Instant::now();
    assert!(registry.stop("ipad", timeout));
    let elapsed = began.elapsed();

    assert!(elapsed >= timeout, "escalated too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "stop took {elapsed:?}");
    assert!(!registry.is_running("ipad"));
}

#[test]
fn test_queries_do_not_wait_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("ready");
    let stubborn = write_script(
        dir.path(),
        "stubborn",
        &format!(
            "trap '' TERM\ntouch '{}'\nwhile :; do sleep 1; done",
            ready.display()
        ),
    );
    let binary = sleeper(&dir);
    let registry = ProcessRegistry::new();

    let pid = registry
        .start("ipad", stubborn.to_str().unwrap(), "iPadMirror", 7000, &[])
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || ready.exists()));

    std::thread::scope(|scope| {
        let stopper = scope.spawn(|| registry.stop("ipad", SHORT));
        assert!(wait_until(Duration::from_secs(1), || {
            registry.status("ipad").is_some_and(|s| s.stopping)
        }));

        let began = Instant::now();
        assert!(registry.is_running("ipad"));
        assert_eq!(registry.get_pid("ipad"), Some(pid));
        assert_eq!(registry.list().len(), 1);
        let elapsed = began.elapsed();
        assert!(elapsed < Duration::from_millis(500), "queries blocked for {elapsed:?}");

        // same generation until the stop finishes
        let err = registry
            .start("ipad", &binary, "iPadMirror", 7000, &[])
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRunning { pid: existing, .. } if existing == pid));
        assert!(!registry.stop("ipad", SHORT));

        assert!(stopper.join().unwrap());
    });

    assert!(!registry.is_running("ipad"));
    assert!(kill(Pid::from_raw(pid as i32), None).is_err());
}

#[test]
fn test_argument_vector() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("argv");
    let recorder = write_script(
        dir.path(),
        "uxplay",
        &format!("printf '%s\\n' \"$0\" \"$@\" > '{}'\nexec sleep 30", out.display()),
    );
    let registry = ProcessRegistry::new();

    registry
        .start("ipad", recorder.to_str().unwrap(), "iPadMirror", 7000, &[])
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        fs::read_to_string(&out).map_or(false, |s| s.lines().count() == 7)
    }));

    let recorded = fs::read_to_string(&out).unwrap();
    let argv: Vec<&str> = recorded.lines().collect();
    let expected = [
        recorder.to_str().unwrap(),
        "-n",
        "iPadMirror",
        "-p",
        "7000",
        "-vsync",
        "no",
    ];
    assert_eq!(argv, expected);
    assert!(registry.stop("ipad", SHORT));
}

#[test]
fn test_extra_args_are_appended() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("argv");
    let recorder = write_script(
        dir.path(),
        "uxplay",
        &format!("printf '%s\\n' \"$@\" > '{}'\nexec sleep 30", out.display()),
    );
    let registry = ProcessRegistry::new();
    let extra = vec!["-fs".to_string(), "two words".to_string()];

    registry
        .start("ipad", recorder.to_str().unwrap(), "iPad Mirror", 7000, &extra)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        fs::read_to_string(&out).map_or(false, |s| s.lines().count() == 8)
    }));

    let recorded = fs::read_to_string(&out).unwrap();
    let argv: Vec<&str> = recorded.lines().collect();
    assert_eq!(
        argv,
        ["-n", "iPad Mirror", "-p", "7000", "-vsync", "no", "-fs", "two words"]
    );
    assert!(registry.stop("ipad", SHORT));
}

#[test]
fn test_concurrent_starts_spawn_once() {
    let dir = tempfile::tempdir().unwrap();
    let binary = sleeper(&dir);
    let registry = ProcessRegistry::new();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| registry.start("ipad", &binary, "iPadMirror", 7000, &[])))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let started: Vec<u32> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(started.len(), 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, RegistryError::AlreadyRunning { pid, .. } if *pid == started[0]));
        }
    }
    assert_eq!(registry.running_count(), 1);
    assert!(registry.stop("ipad", SHORT));
}

#[test]
fn test_status_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let binary = sleeper(&dir);
    let registry = ProcessRegistry::new();

    let pid = registry.start("iphone", &binary, "iPhoneMirror", 7100, &[]).unwrap();
    registry.start("ipad", &binary, "iPadMirror", 7000, &[]).unwrap();

    let status = registry.status("iphone").unwrap();
    assert_eq!(status.pid, pid);
    assert_eq!(status.airplay_name, "iPhoneMirror");
    assert_eq!(status.base_port, 7100);
    assert_eq!(status.executable, PathBuf::from(&binary));
    assert!(!status.stopping);

    let labels: Vec<String> = registry.list().into_iter().map(|s| s.label).collect();
    assert_eq!(labels, ["ipad", "iphone"]);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["label"], "iphone");
    assert_eq!(json["base_port"], 7100);

    assert_eq!(registry.shutdown(SHORT), 2);
}

#[test]
fn test_spawn_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let broken = dir.path().join("uxplay");
    fs::write(&broken, "#!/nonexistent/interpreter\n").unwrap();
    fs::set_permissions(&broken, fs::Permissions::from_mode(0o755)).unwrap();
    let registry = ProcessRegistry::new();

    let err = registry
        .start("ipad", broken.to_str().unwrap(), "iPadMirror", 7000, &[])
        .unwrap_err();
    assert!(matches!(err, RegistryError::Spawn { ref label, .. } if label == "ipad"));
    assert!(!registry.is_running("ipad"));
    assert_eq!(registry.running_count(), 0);
}

#[test]
fn test_dropping_registry_kills_receivers() {
    let dir = tempfile::tempdir().unwrap();
    let binary = sleeper(&dir);
    let registry = ProcessRegistry::new();

    let pid = registry.start("ipad", &binary, "iPadMirror", 7000, &[]).unwrap();
    drop(registry);

    assert!(kill(Pid::from_raw(pid as i32), None).is_err());
}
