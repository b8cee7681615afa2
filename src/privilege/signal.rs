//! Signal delivery to processes and process groups we may not own

use super::{PrivilegeRunner, DEFAULT_COMMAND_TIMEOUT};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

impl PrivilegeRunner {
    /// Send `signal` to `pid`, escalating through `kill` on permission errors.
    ///
    /// A pid that no longer exists counts as delivered. Never fails loudly:
    /// `false` tells the caller to try its next escalation step.
    pub fn send_signal(&self, pid: i32, signal: Signal) -> bool {
        if pid <= 1 {
            warn!("Refusing to signal pid {}", pid);
            return false;
        }
        let escalated = vec![
            "kill".to_string(),
            format!("-{}", signal as i32),
            pid.to_string(),
        ];
        self.deliver_signal(Pid::from_raw(pid), signal, escalated, &format!("pid {}", pid))
    }

    /// Same as [`send_signal`](Self::send_signal) for a whole process group.
    pub fn send_signal_to_group(&self, pgid: i32, signal: Signal) -> bool {
        if pgid <= 1 {
            warn!("Refusing to signal process group {}", pgid);
            return false;
        }
        let escalated = vec![
            "kill".to_string(),
            format!("-{}", signal as i32),
            "--".to_string(),
            format!("-{}", pgid),
        ];
        self.deliver_signal(
            Pid::from_raw(-pgid),
            signal,
            escalated,
            &format!("process group {}", pgid),
        )
    }

    fn deliver_signal(&self, target: Pid, signal: Signal, escalated: Vec<String>, label: &str) -> bool {
        match (self.deliver)(target, signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => {
                debug!("{} already gone", label);
                true
            }
            Err(Errno::EPERM) => {
                debug!("Permission denied sending {} to {}; escalating", signal, label);
                match self.run_elevated(&escalated, None, DEFAULT_COMMAND_TIMEOUT) {
                    Ok(output) if output.success() => true,
                    Ok(output) if output.message().contains("No such process") => true,
                    Ok(output) => {
                        warn!(
                            "Failed to deliver {} to {}: {}",
                            signal,
                            label,
                            output.message()
                        );
                        false
                    }
                    Err(e) => {
                        warn!("Unable to escalate {} for {}: {}", signal, label, e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("Failed to send {} to {}: {}", signal, label, e);
                false
            }
        }
    }
}

/// Whether `pid` is still running. Zombies count as gone.
pub fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH)) {
        return false;
    }
    !is_zombie(pid)
}

fn is_zombie(pid: i32) -> bool {
    // state is the first field after the parenthesized command name
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::super::tests::ScriptedPrompt;
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn permission_denied(_: Pid, _: Signal) -> nix::Result<()> {
        Err(Errno::EPERM)
    }

    fn no_such_process(_: Pid, _: Signal) -> nix::Result<()> {
        Err(Errno::ESRCH)
    }

    /// Helper script that records its arguments and exits with `code`.
    fn recording_helper(dir: &TempDir, code: i32) -> (PathBuf, PathBuf) {
        let log = dir.path().join("calls.log");
        let script = dir.path().join("helper");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" >> {}\nexit {}\n",
                log.display(),
                code
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    fn calls(log: &Path) -> Vec<String> {
        fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_group_signal_escalates_once_on_permission_error() {
        let dir = TempDir::new().unwrap();
        let (helper, log) = recording_helper(&dir, 1);
        let runner = PrivilegeRunner::with_tools(Some(helper), None, ScriptedPrompt::new(vec![]))
            .with_signal_delivery(permission_denied);

        assert!(!runner.send_signal_to_group(4242, Signal::SIGTERM));
        assert_eq!(calls(&log), vec!["kill -15 -- -4242"]);
    }

    #[test]
    fn test_pid_signal_escalation_success() {
        let dir = TempDir::new().unwrap();
        let (helper, log) = recording_helper(&dir, 0);
        let runner = PrivilegeRunner::with_tools(Some(helper), None, ScriptedPrompt::new(vec![]))
            .with_signal_delivery(permission_denied);

        assert!(runner.send_signal(4242, Signal::SIGKILL));
        assert_eq!(calls(&log), vec!["kill -9 4242"]);
    }

    #[test]
    fn test_missing_process_counts_as_delivered() {
        let dir = TempDir::new().unwrap();
        let (helper, log) = recording_helper(&dir, 1);
        let runner = PrivilegeRunner::with_tools(Some(helper), None, ScriptedPrompt::new(vec![]))
            .with_signal_delivery(no_such_process);

        assert!(runner.send_signal(4242, Signal::SIGTERM));
        assert!(runner.send_signal_to_group(4242, Signal::SIGTERM));
        assert!(calls(&log).is_empty());
    }

    #[test]
    fn test_refuses_special_pids() {
        let runner = PrivilegeRunner::with_tools(None, None, ScriptedPrompt::new(vec![]));
        assert!(!runner.send_signal(0, Signal::SIGTERM));
        assert!(!runner.send_signal(1, Signal::SIGTERM));
        assert!(!runner.send_signal_to_group(-5, Signal::SIGTERM));
    }

    #[test]
    fn test_escalation_without_tools_fails() {
        let runner = PrivilegeRunner::with_tools(None, None, ScriptedPrompt::new(vec![]))
            .with_signal_delivery(permission_denied);
        assert!(!runner.send_signal(4242, Signal::SIGTERM));
    }

    #[test]
    fn test_process_exists() {
        assert!(process_exists(std::process::id() as i32));
        assert!(!process_exists(0));
    }

    #[test]
    fn test_exited_child_is_gone_before_reaping() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(!process_exists(pid));
        child.wait().unwrap();
    }
}
