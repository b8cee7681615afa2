//! Tracking and termination of tunnel processes
//!
//! [`ProcessRegistry`] is shared by every supervisor so that a cleanup pass
//! started by one profile never kills a process another supervisor owns.
//! Processes left behind by an earlier run are found by scanning the OS
//! process list for the tunnel binary with a profile's host tokens.

use crate::privilege::{lock, process_exists, PrivilegeRunner};
use crate::profile::{ConnectionProfile, TUNNEL_BINARY};
use nix::sys::signal::Signal;
use nix::unistd::{getpgid, Pid};
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{debug, error, info, warn};

const EXIT_POLL: Duration = Duration::from_millis(200);

/// A tunnel process started by this application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedProcess {
    pub pid: u32,
    pub pgid: Option<i32>,
    pub profile: String,
    /// Launch command line
    pub signature: Vec<String>,
}

/// pid -> process bookkeeping for every live supervisor
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<u32, TrackedProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32, pgid: Option<i32>, profile: &str, signature: Vec<String>) {
        debug!("[{}] Tracking pid {} (pgid {:?})", profile, pid, pgid);
        lock(&self.entries).insert(
            pid,
            TrackedProcess {
                pid,
                pgid,
                profile: profile.to_string(),
                signature,
            },
        );
    }

    pub fn unregister(&self, pid: u32) -> Option<TrackedProcess> {
        lock(&self.entries).remove(&pid)
    }

    pub fn for_profile(&self, profile: &str) -> Vec<TrackedProcess> {
        lock(&self.entries)
            .values()
            .filter(|p| p.profile == profile)
            .cloned()
            .collect()
    }

    pub fn is_tracked(&self, pid: u32, pgid: Option<i32>) -> bool {
        let entries = lock(&self.entries);
        entries.contains_key(&pid)
            || pgid.is_some_and(|g| entries.values().any(|p| p.pgid == Some(g)))
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

/// A process seen in the OS process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
}

impl ProcessInfo {
    /// Whether this looks like the tunnel binary
    pub fn is_tunnel(&self) -> bool {
        self.name.contains(TUNNEL_BINARY)
            || self
                .cmdline
                .first()
                .is_some_and(|arg0| arg0.contains(TUNNEL_BINARY))
    }
}

pub trait ProcessScanner: Send + Sync {
    fn processes(&self) -> Vec<ProcessInfo>;
}

/// Process table snapshot through `sysinfo`
#[derive(Debug, Default)]
pub struct SysinfoScanner;

impl ProcessScanner for SysinfoScanner {
    fn processes(&self) -> Vec<ProcessInfo> {
        let system = System::new_all();
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                cmdline: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
            })
            .collect()
    }
}

/// Grace periods used when stopping a process
#[derive(Debug, Clone, Copy)]
pub struct StopTimeouts {
    /// Wait after SIGTERM
    pub term_grace: Duration,
    /// Wait after SIGKILL
    pub kill_grace: Duration,
}

impl Default for StopTimeouts {
    fn default() -> Self {
        Self {
            term_grace: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Untracked tunnel processes whose command line matches `profile`.
pub fn find_untracked(
    scanner: &dyn ProcessScanner,
    registry: &ProcessRegistry,
    profile: &ConnectionProfile,
    signatures: &[Vec<String>],
) -> Vec<ProcessInfo> {
    let own_pid = std::process::id();
    scanner
        .processes()
        .into_iter()
        .filter(|p| p.pid != own_pid && !p.cmdline.is_empty() && p.is_tunnel())
        .filter(|p| !registry.is_tracked(p.pid, pgid_of(p.pid)))
        .filter(|p| profile.matches_command_line(&p.cmdline.join(" "), signatures))
        .collect()
}

/// Stop `pid`: SIGTERM to its group (or itself), then SIGKILL after the grace
/// period. Blocks until the process is gone or every level was tried.
///
/// Returns whether the process is gone.
pub fn terminate(
    runner: &PrivilegeRunner,
    registry: &ProcessRegistry,
    pid: u32,
    pgid: Option<i32>,
    profile: &str,
    timeouts: StopTimeouts,
) -> bool {
    let raw = pid as i32;
    if !process_exists(raw) {
        registry.unregister(pid);
        return true;
    }

    info!("[{}] Stopping {} pid {}", profile, TUNNEL_BINARY, pid);
    let delivered = pgid.is_some_and(|g| runner.send_signal_to_group(g, Signal::SIGTERM));
    if !delivered {
        runner.send_signal(raw, Signal::SIGTERM);
    }

    if !wait_for_exit(raw, timeouts.term_grace) {
        warn!(
            "[{}] {} pid {} still running; escalating",
            profile, TUNNEL_BINARY, pid
        );
        if let Some(g) = pgid {
            runner.send_signal_to_group(g, Signal::SIGKILL);
        }
        runner.send_signal(raw, Signal::SIGKILL);
        if !wait_for_exit(raw, timeouts.kill_grace) {
            error!(
                "[{}] {} pid {} did not terminate",
                profile, TUNNEL_BINARY, pid
            );
            return false;
        }
    }

    registry.unregister(pid);
    true
}

/// Stop every tracked process of `profile` and every untracked one matching
/// its launch signatures.
pub fn cleanup_profile(
    runner: &PrivilegeRunner,
    registry: &ProcessRegistry,
    scanner: &dyn ProcessScanner,
    profile: &ConnectionProfile,
    extra_signature: Option<&[String]>,
    timeouts: StopTimeouts,
) {
    let mut signatures = Vec::new();
    for tracked in registry.for_profile(&profile.name) {
        if !tracked.signature.is_empty() {
            signatures.push(tracked.signature.clone());
        }
        terminate(
            runner,
            registry,
            tracked.pid,
            tracked.pgid,
            &profile.name,
            timeouts,
        );
    }
    if let Some(signature) = extra_signature {
        signatures.push(signature.to_vec());
    }

    for orphan in find_untracked(scanner, registry, profile, &signatures) {
        info!(
            "[{}] Found leftover tunnel process {}: {}",
            profile.name,
            orphan.pid,
            orphan.cmdline.join(" ")
        );
        terminate(
            runner,
            registry,
            orphan.pid,
            pgid_of(orphan.pid),
            &profile.name,
            timeouts,
        );
    }
}

pub(crate) fn pgid_of(pid: u32) -> Option<i32> {
    getpgid(Some(Pid::from_raw(pid as i32)))
        .ok()
        .map(|g| g.as_raw())
        .filter(|g| *g > 1)
}

fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_exists(pid) {
            return true;
        }
        thread::sleep(EXIT_POLL);
    }
    !process_exists(pid)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::privilege::tests::ScriptedPrompt;
    use crate::profile::AuthMode;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    /// Scanner returning a fixed process list
    #[derive(Default)]
    pub(crate) struct FakeScanner {
        pub processes: Mutex<Vec<ProcessInfo>>,
    }

    impl ProcessScanner for FakeScanner {
        fn processes(&self) -> Vec<ProcessInfo> {
            self.processes.lock().unwrap().clone()
        }
    }

    fn info(pid: u32, cmdline: &str) -> ProcessInfo {
        let cmdline: Vec<String> = cmdline.split_whitespace().map(str::to_string).collect();
        ProcessInfo {
            pid,
            name: cmdline[0].rsplit('/').next().unwrap().to_string(),
            cmdline,
        }
    }

    fn quick() -> StopTimeouts {
        StopTimeouts {
            term_grace: Duration::from_millis(500),
            kill_grace: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_registry_bookkeeping() {
        let registry = ProcessRegistry::new();
        registry.register(100, Some(100), "corp", vec!["openfortivpn".to_string()]);
        registry.register(200, Some(200), "lab", vec![]);

        assert_eq!(registry.for_profile("corp").len(), 1);
        assert!(registry.is_tracked(100, None));
        assert!(registry.is_tracked(999, Some(200)));
        assert!(!registry.is_tracked(999, Some(300)));

        assert_eq!(registry.unregister(100).unwrap().profile, "corp");
        assert!(registry.for_profile("corp").is_empty());
        assert!(registry.unregister(100).is_none());
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_find_untracked_matches_profile_tokens() {
        let registry = ProcessRegistry::new();
        registry.register(4_000_001, None, "corp", vec![]);
        let scanner = FakeScanner::default();
        *scanner.processes.lock().unwrap() = vec![
            info(4_000_001, "/usr/bin/openfortivpn vpn.example.com:443"),
            info(4_000_002, "/usr/bin/openfortivpn vpn.example.com:443"),
            info(4_000_003, "/usr/bin/openfortivpn other.example.com:443"),
            info(4_000_004, "/usr/bin/ssh vpn.example.com:443"),
            info(4_000_005, "/usr/bin/openfortivpn vpn.example.com:443 --saml-login"),
        ];
        let profile = ConnectionProfile::new("corp", "vpn.example.com", 443);

        let found = find_untracked(&scanner, &registry, &profile, &[]);
        let pids: Vec<u32> = found.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![4_000_002]);

        let mut saml = profile.clone();
        saml.auth_mode = AuthMode::Saml;
        let found = find_untracked(&scanner, &registry, &saml, &[]);
        let pids: Vec<u32> = found.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![4_000_005]);
    }

    #[test]
    fn test_terminate_running_child() {
        let mut child = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
        let pid = child.id();
        let registry = ProcessRegistry::new();
        registry.register(pid, Some(pid as i32), "corp", vec![]);
        let runner = PrivilegeRunner::with_tools(None, None, ScriptedPrompt::new(vec![]));

        assert!(terminate(&runner, &registry, pid, Some(pid as i32), "corp", quick()));
        assert!(registry.is_empty());
        child.wait().unwrap();
    }

    #[test]
    fn test_terminate_escalates_to_kill() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        thread::sleep(Duration::from_millis(200));
        let registry = ProcessRegistry::new();
        let runner = PrivilegeRunner::with_tools(None, None, ScriptedPrompt::new(vec![]));

        let started = Instant::now();
        assert!(terminate(&runner, &registry, pid, Some(pid as i32), "corp", quick()));
        assert!(started.elapsed() >= Duration::from_millis(400));
        child.wait().unwrap();
    }

    #[test]
    fn test_terminate_missing_process() {
        let registry = ProcessRegistry::new();
        registry.register(4_000_123, None, "corp", vec![]);
        let runner = PrivilegeRunner::with_tools(None, None, ScriptedPrompt::new(vec![]));

        assert!(terminate(&runner, &registry, 4_000_123, None, "corp", quick()));
        assert!(registry.is_empty());
    }
}
