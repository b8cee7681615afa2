//! Bounded synchronous command execution

use super::PrivilegeError;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exit code and captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// The most useful diagnostic text: stderr, or stdout when stderr is empty.
    pub fn message(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }

    pub(crate) fn reports_missing_agent(&self) -> bool {
        self.message()
            .to_ascii_lowercase()
            .contains("no authentication agent")
    }

    pub(crate) fn reports_rejected_password(&self) -> bool {
        let message = self.message().to_ascii_lowercase();
        message.contains("incorrect password")
            || message.contains("sorry, try again")
            || message.contains("a password is required")
    }
}

/// Spawn `argv`, feed `input` on stdin and wait at most `timeout`.
///
/// On timeout the child is killed and `PrivilegeError::Timeout` is returned.
pub(crate) fn run_with_timeout(
    argv: &[String],
    input: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, PrivilegeError> {
    let (program, args) = argv.split_first().ok_or_else(|| PrivilegeError::SpawnError {
        command: String::new(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
    })?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| PrivilegeError::SpawnError {
            command: program.clone(),
            source,
        })?;

    if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
        let text = text.to_string();
        // a child that never reads must not block us on a full pipe
        thread::spawn(move || {
            let _ = stdin.write_all(text.as_bytes());
        });
    }

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!("{} timed out after {:?}, killing it", program, timeout);
            let _ = child.kill();
            let _ = child.wait();
            return Err(PrivilegeError::Timeout {
                command: program.clone(),
                secs: timeout.as_secs(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        code: status.code().unwrap_or(-1),
        stdout: stdout.map(join_reader).unwrap_or_default(),
        stderr: stderr.map(join_reader).unwrap_or_default(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
