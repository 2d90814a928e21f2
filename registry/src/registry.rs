//! Process registry for UxPlay receivers
//!
//! Maps a caller-chosen label to at most one live receiver process. Liveness
//! is always re-checked with `try_wait` at the time of the call, so a receiver
//! that crashed or was killed behind our back reads as stopped.
//!
//! Locking: the label map only hands out per-label slots. Every
//! check-and-mutate sequence for one label runs under that label's mutex, so
//! racing calls on the same label serialise while other labels proceed. The
//! termination wait in `stop` runs outside the lock; the slot holds a
//! `Stopping` marker meanwhile so the label still reads as taken.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{RegistryError, Result};
use crate::resolver;

/// Per-phase wait used by callers that have no better idea
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bound on reaping a receiver killed while its record is dropped
const DROP_REAP_TIMEOUT: Duration = Duration::from_secs(1);

type Slot = Arc<Mutex<Option<Entry>>>;

/// What a label currently holds
enum Entry {
    Live(Instance),
    /// Handed to a `stop` that is waiting for the process to go away
    Stopping(InstanceStatus),
}

impl Entry {
    fn pid(&self) -> u32 {
        match self {
            Entry::Live(instance) => instance.pid,
            Entry::Stopping(status) => status.pid,
        }
    }

    /// Whether the entry still stands for a process. A stopping one does until
    /// its `stop` has reaped it.
    fn is_active(&mut self) -> bool {
        match self {
            Entry::Live(instance) => instance.is_alive(),
            Entry::Stopping(_) => true,
        }
    }

    fn status(&self) -> InstanceStatus {
        match self {
            Entry::Live(instance) => instance.status(),
            Entry::Stopping(status) => status.clone(),
        }
    }
}

/// One supervised receiver process
struct Instance {
    label: String,
    child: Child,
    pid: u32,
    executable: PathBuf,
    airplay_name: String,
    base_port: u16,
    started_at: DateTime<Utc>,
}

impl Instance {
    /// Non-blocking "has it exited" check against the OS
    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(label = %self.label, pid = self.pid, %status, "Receiver has exited");
                false
            }
            Err(e) => {
                // ECHILD: somebody else reaped it, so it is gone either way
                warn!(label = %self.label, pid = self.pid, "Failed to poll receiver: {e}");
                false
            }
        }
    }

    /// Poll until the process exits or `timeout` elapses. Returns whether it exited.
    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!(label = %self.label, pid = self.pid, %status, "Receiver exited");
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(label = %self.label, pid = self.pid, "Error waiting for receiver: {e}");
                    return true;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// SIGTERM, wait, then SIGKILL and wait again.
    fn terminate(&mut self, timeout: Duration) {
        let pid = Pid::from_raw(self.pid as i32);
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => debug!(label = %self.label, pid = self.pid, "Sent SIGTERM"),
            Err(e) => warn!(label = %self.label, pid = self.pid, "Failed to send SIGTERM: {e}"),
        }

        if self.wait_for_exit(timeout) {
            return;
        }

        warn!(
            label = %self.label,
            pid = self.pid,
            "Receiver ignored SIGTERM for {timeout:?}, sending SIGKILL"
        );
        if let Err(e) = self.child.kill() {
            warn!(label = %self.label, pid = self.pid, "Failed to send SIGKILL: {e}");
        }

        if !self.wait_for_exit(timeout) {
            error!(
                label = %self.label,
                pid = self.pid,
                "Receiver not reaped within {timeout:?} after SIGKILL"
            );
        }
    }

    fn status(&self) -> InstanceStatus {
        InstanceStatus {
            label: self.label.clone(),
            pid: self.pid,
            executable: self.executable.clone(),
            airplay_name: self.airplay_name.clone(),
            base_port: self.base_port,
            started_at: self.started_at,
            stopping: false,
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.is_alive() {
            warn!(label = %self.label, pid = self.pid, "Killing receiver on drop");
            if let Err(e) = self.child.kill() {
                warn!(label = %self.label, pid = self.pid, "Failed to kill receiver on drop: {e}");
            }
            self.wait_for_exit(DROP_REAP_TIMEOUT);
        }
    }
}

/// Snapshot of a live receiver, suitable for display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub label: String,
    pub pid: u32,
    pub executable: PathBuf,
    pub airplay_name: String,
    pub base_port: u16,
    pub started_at: DateTime<Utc>,
    /// A `stop` is waiting for this process to exit
    pub stopping: bool,
}

/// Argument vector for one receiver: executable first, then the fixed
/// `-n/-p/-vsync` flags, then `extra_args` verbatim.
pub fn receiver_command_line(
    executable: &Path,
    airplay_name: &str,
    base_port: u16,
    extra_args: &[String],
) -> Vec<OsString> {
    let mut argv: Vec<OsString> = vec![
        executable.as_os_str().to_owned(),
        "-n".into(),
        airplay_name.into(),
        "-p".into(),
        base_port.to_string().into(),
        "-vsync".into(),
        "no".into(),
    ];
    argv.extend(extra_args.iter().map(OsString::from));
    argv
}

/// Reject base ports the receiver cannot bind (it needs base_port..=base_port+2)
pub fn validate_port(base_port: u16) -> Result<()> {
    // the receiver binds base_port, base_port+1 and base_port+2
    if base_port == 0 || base_port > u16::MAX - 2 {
        return Err(RegistryError::InvalidPort(base_port));
    }
    Ok(())
}

/// Registry of labeled receiver processes.
///
/// Construct one per supervising program and share it behind an `Arc`.
#[derive(Default)]
pub struct ProcessRegistry {
    instances: DashMap<String, Slot>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a receiver under `label` and return its PID.
    ///
    /// Fails with `AlreadyRunning` if a live receiver holds the label. On any
    /// error no process is left running and the registry is unchanged.
    pub fn start(
        &self,
        label: &str,
        binary: &str,
        airplay_name: &str,
        base_port: u16,
        extra_args: &[String],
    ) -> Result<u32> {
        if label.is_empty() {
            return Err(RegistryError::EmptyLabel);
        }
        validate_port(base_port)?;

        let slot = self.slot(label);
        let result = {
            let mut entry = slot.lock();
            if let Some(current) = entry.as_mut() {
                if current.is_active() {
                    return Err(RegistryError::AlreadyRunning {
                        label: label.to_string(),
                        pid: current.pid(),
                    });
                }
                debug!(label, pid = current.pid(), "Discarding exited receiver record");
                *entry = None;
            }

            spawn_receiver(label, binary, airplay_name, base_port, extra_args).map(|instance| {
                let pid = instance.pid;
                *entry = Some(Entry::Live(instance));
                pid
            })
        };

        if result.is_err() {
            drop(slot);
            self.prune(label);
        }
        result
    }

    /// Stop the receiver under `label`.
    ///
    /// Returns `false` when there was nothing to stop (no record, the process
    /// had already exited, or another `stop` is already waiting on it). Once
    /// this returns `true` the record is gone.
    ///
    /// The label lock is not held during the wait: concurrent queries see the
    /// receiver as running with `stopping` set, and `start` is refused.
    pub fn stop(&self, label: &str, timeout: Duration) -> bool {
        let Some(slot) = self.existing_slot(label) else {
            return false;
        };

        let claimed = {
            let mut entry = slot.lock();
            match entry.take() {
                None => None,
                Some(Entry::Stopping(status)) => {
                    debug!(label, pid = status.pid, "Receiver is already being stopped");
                    *entry = Some(Entry::Stopping(status));
                    None
                }
                Some(Entry::Live(mut instance)) => {
                    if instance.is_alive() {
                        let mut status = instance.status();
                        status.stopping = true;
                        *entry = Some(Entry::Stopping(status));
                        Some(instance)
                    } else {
                        debug!(label, pid = instance.pid, "Receiver already exited, dropping record");
                        None
                    }
                }
            }
        };

        let stopped = match claimed {
            Some(mut instance) => {
                info!(label, pid = instance.pid, "Stopping receiver");
                instance.terminate(timeout);
                drop(instance);
                *slot.lock() = None;
                true
            }
            None => false,
        };

        drop(slot);
        self.prune(label);
        stopped
    }

    /// Whether a live receiver holds `label`
    pub fn is_running(&self, label: &str) -> bool {
        self.get_pid(label).is_some()
    }

    /// PID of the receiver under `label`, only while it is confirmed alive
    pub fn get_pid(&self, label: &str) -> Option<u32> {
        self.status(label).map(|status| status.pid)
    }

    /// Snapshot of the receiver under `label`, only while it is confirmed alive
    /// or still being stopped. Never waits on a `stop` in progress.
    pub fn status(&self, label: &str) -> Option<InstanceStatus> {
        let slot = self.existing_slot(label)?;
        let status = {
            let mut entry = slot.lock();
            let active = entry.as_mut().map(Entry::is_active);
            match active {
                Some(true) => entry.as_ref().map(Entry::status),
                Some(false) => {
                    *entry = None;
                    None
                }
                None => None,
            }
        };

        if status.is_none() {
            drop(slot);
            self.prune(label);
        }
        status
    }

    /// Snapshots of every live receiver, sorted by label
    pub fn list(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<InstanceStatus> = self
            .labels()
            .iter()
            .filter_map(|label| self.status(label))
            .collect();
        statuses.sort_by(|a, b| a.label.cmp(&b.label));
        statuses
    }

    /// Number of live receivers
    pub fn running_count(&self) -> usize {
        self.list().len()
    }

    /// Stop every tracked receiver and return how many were actually stopped.
    ///
    /// Labels are stopped concurrently; the outcome for one never affects the
    /// others.
    pub fn stop_all(&self, timeout: Duration) -> usize {
        let labels = self.labels();
        if labels.is_empty() {
            return 0;
        }

        std::thread::scope(|scope| {
            let handles: Vec<_> = labels
                .iter()
                .map(|label| scope.spawn(move || self.stop(label, timeout)))
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(false))
                .filter(|stopped| *stopped)
                .count()
        })
    }

    /// Tear down: stop everything still tracked
    pub fn shutdown(&self, timeout: Duration) -> usize {
        info!("Stopping all receivers...");
        let stopped = self.stop_all(timeout);
        info!("{stopped} receiver(s) stopped");
        stopped
    }

    fn labels(&self) -> Vec<String> {
        self.instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn slot(&self, label: &str) -> Slot {
        Arc::clone(self.instances.entry(label.to_string()).or_default().value())
    }

    fn existing_slot(&self, label: &str) -> Option<Slot> {
        self.instances
            .get(label)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the map entry for `label` if its slot is empty and unused
    fn prune(&self, label: &str) {
        self.instances.remove_if(label, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_some_and(|entry| entry.is_none())
        });
    }
}

fn spawn_receiver(
    label: &str,
    binary: &str,
    airplay_name: &str,
    base_port: u16,
    extra_args: &[String],
) -> Result<Instance> {
    let executable = resolver::resolve(binary)?;
    let argv = receiver_command_line(&executable, airplay_name, base_port, extra_args);

    info!(
        label,
        executable = %executable.display(),
        airplay_name,
        base_port,
        "Starting receiver"
    );

    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| RegistryError::Spawn {
            label: label.to_string(),
            source,
        })?;

    let pid = child.id();
    info!(label, pid, "Receiver started");

    Ok(Instance {
        label: label.to_string(),
        child,
        pid,
        executable,
        airplay_name: airplay_name.to_string(),
        base_port,
        started_at: Utc::now(),
    })
}
