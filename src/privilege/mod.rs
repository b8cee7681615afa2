//! Privilege escalation for tunnel processes, route changes and signals
//!
//! Two kinds of elevation tool are supported:
//!
//! - a one-shot helper (`pkexec`) that shows its own consent dialog and needs
//!   nothing from us, and
//! - a credential tool (`sudo -S`) that reads a secret from standard input.
//!
//! The helper wins when present. Otherwise the secret is requested once through
//! an injected [`ElevationPrompt`] and cached in memory for the following
//! invocations. It is never written to disk.

mod exec;
mod signal;

pub use exec::CommandOutput;
pub use signal::process_exists;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

pub const HELPER_TOOL: &str = "pkexec";
pub const CREDENTIAL_TOOL: &str = "sudo";

/// Timeout for short elevated commands (route changes, kill) when none is configured.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const ELEVATION_PROMPT: &str =
    "Administrative privileges are required to manage VPN connections.\nEnter your sudo password.";

#[derive(Error, Debug)]
pub enum PrivilegeError {
    #[error("Neither pkexec nor sudo is available on this system")]
    ElevationUnavailable,
    #[error("Privilege escalation was cancelled by the user")]
    ElevationCancelled,
    #[error("Failed to spawn {command}: {source}")]
    SpawnError {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} did not finish within {secs}s")]
    Timeout { command: String, secs: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of the credential-tool secret, implemented by the UI layer.
pub trait ElevationPrompt: Send + Sync {
    /// Ask for the secret. Returns the secret and whether it may be reused for
    /// the rest of the session, or `None` if the user declined.
    fn request_secret(&self, prompt: &str) -> Option<(String, bool)>;
}

/// Which elevation tool to use when both are installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationPreference {
    #[default]
    Auto,
    Helper,
    Credential,
}

/// A command line ready to spawn, plus the secret to feed on stdin first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElevatedCommand {
    pub argv: Vec<String>,
    pub credential: Option<String>,
}

struct CachedCredential {
    secret: String,
    allow_reuse: bool,
}

type SignalFn = fn(Pid, Signal) -> nix::Result<()>;

pub struct PrivilegeRunner {
    helper: Mutex<Option<PathBuf>>,
    credential_tool: Option<PathBuf>,
    prompt: Arc<dyn ElevationPrompt>,
    cached: Mutex<Option<CachedCredential>>,
    prompt_lock: Mutex<()>,
    deliver: SignalFn,
}

impl PrivilegeRunner {
    /// Look up the elevation tools on `PATH`.
    pub fn detect(preference: ElevationPreference, prompt: Arc<dyn ElevationPrompt>) -> Self {
        let helper = match preference {
            ElevationPreference::Credential => None,
            _ => find_in_path(HELPER_TOOL),
        };
        let credential_tool = match preference {
            ElevationPreference::Helper => None,
            _ => find_in_path(CREDENTIAL_TOOL),
        };
        info!(
            "Elevation tools: helper={:?} credential={:?}",
            helper, credential_tool
        );
        Self::with_tools(helper, credential_tool, prompt)
    }

    pub fn with_tools(
        helper: Option<PathBuf>,
        credential_tool: Option<PathBuf>,
        prompt: Arc<dyn ElevationPrompt>,
    ) -> Self {
        Self {
            helper: Mutex::new(helper),
            credential_tool,
            prompt,
            cached: Mutex::new(None),
            prompt_lock: Mutex::new(()),
            deliver: nix::sys::signal::kill,
        }
    }

    /// Replace the unprivileged signal delivery function (used by tests).
    pub fn with_signal_delivery(mut self, deliver: SignalFn) -> Self {
        self.deliver = deliver;
        self
    }

    fn helper(&self) -> Option<PathBuf> {
        lock(&self.helper).clone()
    }

    pub fn has_helper(&self) -> bool {
        self.helper().is_some()
    }

    /// Stop using the helper, e.g. when it has no authentication agent.
    /// Later commands go through the credential tool. Returns whether a
    /// helper was in use.
    pub fn disable_helper(&self) -> bool {
        let disabled = lock(&self.helper).take().is_some();
        if disabled {
            warn!(
                "{} has no authentication agent; falling back to {}",
                HELPER_TOOL, CREDENTIAL_TOOL
            );
        }
        disabled
    }

    /// Prefix `base` with the elevation tool.
    ///
    /// With the credential tool this may call the prompt when no secret is cached.
    pub fn build_elevated_command(&self, base: &[String]) -> Result<ElevatedCommand, PrivilegeError> {
        if let Some(helper) = self.helper() {
            let mut argv = vec![helper.to_string_lossy().into_owned()];
            argv.extend(base.iter().cloned());
            return Ok(ElevatedCommand {
                argv,
                credential: None,
            });
        }

        let tool = self
            .credential_tool
            .as_ref()
            .ok_or(PrivilegeError::ElevationUnavailable)?;

        self.ensure_credential_cached(false)?;
        let secret = lock(&self.cached)
            .as_ref()
            .map(|c| c.secret.clone())
            .ok_or(PrivilegeError::ElevationCancelled)?;

        let mut argv = vec![
            tool.to_string_lossy().into_owned(),
            "-S".to_string(),
            "-p".to_string(),
            String::new(),
        ];
        argv.extend(base.iter().cloned());
        Ok(ElevatedCommand {
            argv,
            credential: Some(secret),
        })
    }

    /// Make sure a credential-tool secret is cached. Idempotent.
    ///
    /// `force_allow` marks the cached secret reusable even if the user did not
    /// ask for it. Does nothing when the helper is in use.
    pub fn ensure_credential_cached(&self, force_allow: bool) -> Result<(), PrivilegeError> {
        if self.helper().is_some() {
            return Ok(());
        }
        if self.credential_tool.is_none() {
            return Err(PrivilegeError::ElevationUnavailable);
        }

        let _prompting = lock(&self.prompt_lock);
        if let Some(cached) = lock(&self.cached).as_mut() {
            if force_allow {
                cached.allow_reuse = true;
            }
            return Ok(());
        }

        debug!("Requesting elevation secret");
        let (secret, allow_reuse) = self
            .prompt
            .request_secret(ELEVATION_PROMPT)
            .ok_or(PrivilegeError::ElevationCancelled)?;
        *lock(&self.cached) = Some(CachedCredential {
            secret,
            allow_reuse: allow_reuse || force_allow,
        });
        Ok(())
    }

    pub fn clear_credential(&self) {
        if lock(&self.cached).take().is_some() {
            info!("Cleared cached elevation credential");
        }
    }

    pub fn credential_cached(&self) -> bool {
        lock(&self.cached).is_some()
    }

    pub fn reuse_allowed(&self) -> bool {
        lock(&self.cached).as_ref().is_some_and(|c| c.allow_reuse)
    }

    /// Run `base` elevated, wait for it with a timeout and capture its output.
    ///
    /// The cached secret (if any) is written to stdin before `stdin`.
    pub fn run_elevated(
        &self,
        base: &[String],
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, PrivilegeError> {
        let command = self.build_elevated_command(base)?;
        debug!("Running elevated: {}", base.join(" "));

        let mut input = String::new();
        if let Some(secret) = &command.credential {
            input.push_str(secret);
            input.push('\n');
        }
        if let Some(extra) = stdin {
            input.push_str(extra);
        }
        let input = (command.credential.is_some() || stdin.is_some()).then_some(input);

        let output = exec::run_with_timeout(&command.argv, input.as_deref(), timeout)?;

        if command.credential.is_none()
            && !output.success()
            && output.reports_missing_agent()
            && self.disable_helper()
            && self.credential_tool.is_some()
        {
            return self.run_elevated(base, stdin, timeout);
        }

        if command.credential.is_some() && output.reports_rejected_password() {
            warn!("Elevation secret was rejected");
            self.clear_credential();
        }

        Ok(output)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolve an executable name against `PATH`. Paths containing a `/` are
/// checked as-is.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}
