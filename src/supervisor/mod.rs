//! Supervision of one tunnel process per connection
//!
//! A supervisor is a tokio task owning the tunnel subprocess of one profile.
//! It reads the process output, reacts to the classified events, applies the
//! profile's routes once the tunnel is up and cleans everything up when the
//! process ends. With auto-reconnect enabled it relaunches after an
//! exponential backoff until it is told to stop.

pub mod backoff;
pub mod output;
pub mod process;

pub use backoff::Backoff;
pub use output::{classify, OutputEvent};
pub use process::{
    ProcessInfo, ProcessRegistry, ProcessScanner, StopTimeouts, SysinfoScanner, TrackedProcess,
};

use crate::browser::BrowserLauncher;
use crate::privilege::{find_in_path, PrivilegeError, PrivilegeRunner};
use crate::profile::{ConnectionProfile, TUNNEL_BINARY};
use crate::routing::RouteReconciler;
use output::LineBuffer;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// How long trailing output is collected after the process exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Starting,
    Connecting,
    Authenticating,
    Connected,
    Disconnecting,
    Reconnecting,
    Error,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Starting => "Starting",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Authenticating => "Authenticating",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Error => "Error",
            ConnectionState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Status(ConnectionState),
    Log(String),
    Connected,
    Disconnected,
}

/// Something that happened to the connection of `profile`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub profile: String,
    pub kind: EventKind,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0} binary not found")]
    BinaryMissing(String),
    #[error("Failed to launch {command}: {source}")]
    LaunchFailure {
        command: String,
        source: std::io::Error,
    },
    #[error("Privilege escalation failed: {0}")]
    Privilege(#[from] PrivilegeError),
}

impl SessionError {
    /// Errors that a retry cannot fix
    fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::LaunchFailure { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Tunnel binary name (looked up on `PATH`) or path
    pub binary: String,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub stop: StopTimeouts,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            binary: TUNNEL_BINARY.to_string(),
            reconnect_base: backoff::DEFAULT_BASE,
            reconnect_cap: backoff::DEFAULT_CAP,
            stop: StopTimeouts::default(),
        }
    }
}

/// Collaborators shared by every supervisor
#[derive(Clone)]
pub struct SupervisorContext {
    pub runner: Arc<PrivilegeRunner>,
    pub routes: Arc<RouteReconciler>,
    pub processes: Arc<ProcessRegistry>,
    pub scanner: Arc<dyn ProcessScanner>,
    pub browser: Arc<dyn BrowserLauncher>,
    pub events: broadcast::Sender<SessionEvent>,
    pub settings: SupervisorSettings,
}

/// Owner side of a running supervisor task
pub struct SupervisorHandle {
    profile: ConnectionProfile,
    state: watch::Receiver<ConnectionState>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// True once the task ended or is about to; the state sender is dropped
    /// as the last step of the task.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished() || self.state.has_changed().is_err()
    }

    /// State updates; `changed()` fails once the supervisor is gone.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Ask the supervisor to stop. Suppresses auto-reconnect; repeated calls
    /// are harmless.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait for the task to finish and return its final state.
    pub async fn join(self) -> ConnectionState {
        if let Err(e) = self.task.await {
            error!("[{}] Supervisor task failed: {}", self.profile.name, e);
        }
        *self.state.borrow()
    }
}

#[derive(Debug, Default)]
struct Attempt {
    interface: Option<String>,
    dns_servers: Vec<IpAddr>,
    connected: bool,
    browser_launched: bool,
    password_sent: bool,
    authenticating: bool,
    /// The elevation helper refused to run without a polkit agent
    missing_agent: bool,
    routes: Option<JoinHandle<()>>,
}

enum AttemptEnd {
    Stopped,
    Exited { connected: bool },
}

enum LoopExit {
    Exited(Option<ExitStatus>),
    Stop,
}

pub struct Supervisor {
    ctx: SupervisorContext,
    profile: ConnectionProfile,
    password: Option<String>,
    state: watch::Sender<ConnectionState>,
    stop: watch::Receiver<bool>,
    signature: Option<Vec<String>>,
}

impl Supervisor {
    /// Start supervising `profile` on the current tokio runtime.
    ///
    /// `password` is written to the tunnel when it prompts for one.
    pub fn spawn(
        ctx: SupervisorContext,
        profile: ConnectionProfile,
        password: Option<String>,
    ) -> SupervisorHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (stop_tx, stop_rx) = watch::channel(false);
        let supervisor = Supervisor {
            ctx,
            profile: profile.clone(),
            password,
            state: state_tx,
            stop: stop_rx,
            signature: None,
        };
        let task = tokio::spawn(supervisor.run());
        SupervisorHandle {
            profile,
            state: state_rx,
            stop: stop_tx,
            task,
        }
    }

    fn name(&self) -> &str {
        &self.profile.name
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    fn emit(&self, kind: EventKind) {
        // no subscribers is fine
        let _ = self.ctx.events.send(SessionEvent {
            profile: self.profile.name.clone(),
            kind,
        });
    }

    fn log(&self, message: impl Into<String>) {
        self.emit(EventKind::Log(message.into()));
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        info!("[{}] {}", self.name(), state);
        self.emit(EventKind::Status(state));
    }

    fn fail(&self, err: &SessionError) {
        error!("[{}] {}", self.name(), err);
        self.log(err.to_string());
        self.set_state(ConnectionState::Error);
    }

    async fn run(mut self) {
        let mut backoff = Backoff::new(
            self.ctx.settings.reconnect_base,
            self.ctx.settings.reconnect_cap,
        );

        loop {
            if self.stop_requested() {
                break;
            }
            self.set_state(ConnectionState::Starting);
            let reached_connected = match self.run_once().await {
                Ok(AttemptEnd::Stopped) => break,
                Ok(AttemptEnd::Exited { connected }) => connected,
                Err(e) if e.is_fatal() => {
                    self.fail(&e);
                    return;
                }
                Err(e) => {
                    self.fail(&e);
                    if !self.profile.auto_reconnect {
                        return;
                    }
                    false
                }
            };

            if self.stop_requested() || !self.profile.auto_reconnect {
                break;
            }
            let delay = backoff.next_delay(reached_connected);
            self.set_state(ConnectionState::Reconnecting);
            self.log(format!("Reconnecting in {:?}", delay));
            if self.wait_or_stop(delay).await {
                break;
            }
        }

        if self.stop_requested() {
            self.cleanup_after_stop().await;
        }
        self.set_state(ConnectionState::Stopped);
    }

    /// Sleep for `delay`. Returns true if a stop arrived first.
    async fn wait_or_stop(&self, delay: Duration) -> bool {
        let mut stop = self.stop.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => true,
        }
    }

    async fn run_once(&mut self) -> Result<AttemptEnd, SessionError> {
        let binary = find_in_path(&self.ctx.settings.binary)
            .ok_or_else(|| SessionError::BinaryMissing(self.ctx.settings.binary.clone()))?;
        let binary = binary.to_string_lossy().into_owned();
        let command = self.profile.launch_command(&binary);
        self.signature = Some(command.clone());
        debug!("[{}] Launching {}", self.name(), command.join(" "));

        let runner = self.ctx.runner.clone();
        let base = command.clone();
        let elevated = task::spawn_blocking(move || runner.build_elevated_command(&base))
            .await
            .map_err(|e| SessionError::LaunchFailure {
                command: binary.clone(),
                source: std::io::Error::other(e),
            })??;
        if self.stop_requested() {
            return Ok(AttemptEnd::Stopped);
        }
        if self.profile.interface.is_none() && !self.profile.route_targets.is_empty() {
            self.ctx.routes.record_interface_baseline(self.name());
        }

        let (program, args) = elevated.argv.split_first().ok_or_else(|| SessionError::LaunchFailure {
            command: binary.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| SessionError::LaunchFailure {
                command: program.clone(),
                source,
            })?;
        let pid = child.id().ok_or_else(|| SessionError::LaunchFailure {
            command: program.clone(),
            source: std::io::Error::other("process exited before it was tracked"),
        })?;
        let pgid = pid as i32;
        // track before reading so a concurrent orphan scan skips it
        self.ctx
            .processes
            .register(pid, Some(pgid), self.name(), command.clone());
        self.set_state(ConnectionState::Connecting);

        let mut stdin = child.stdin.take();
        if let Some(secret) = &elevated.credential {
            write_line(&mut stdin, secret).await;
        }

        let (tx, mut rx) = mpsc::channel::<(usize, Vec<u8>)>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward(0, stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward(1, stderr, tx.clone()));
        }
        drop(tx);

        let mut buffers = [LineBuffer::default(), LineBuffer::default()];
        let mut attempt = Attempt::default();
        let mut stop = self.stop.clone();
        let mut output_open = true;

        let exit = loop {
            tokio::select! {
                chunk = rx.recv(), if output_open => match chunk {
                    Some((stream, bytes)) => {
                        for line in buffers[stream].push(&bytes) {
                            self.handle_line(&line, &mut attempt, &mut stdin).await;
                        }
                        if let Some(prompt) = buffers[stream].take_prompt() {
                            self.handle_line(&prompt, &mut attempt, &mut stdin).await;
                        }
                    }
                    None => output_open = false,
                },
                status = child.wait() => break LoopExit::Exited(status.ok()),
                // the `watch::Ref` must not outlive the arm, it is not Send
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break LoopExit::Stop,
            }
        };

        let status = match exit {
            LoopExit::Exited(status) => {
                while let Ok(Some((stream, bytes))) =
                    tokio::time::timeout(DRAIN_TIMEOUT, rx.recv()).await
                {
                    for line in buffers[stream].push(&bytes) {
                        self.handle_line(&line, &mut attempt, &mut stdin).await;
                    }
                }
                for buffer in buffers.iter_mut() {
                    if let Some(line) = buffer.finish() {
                        self.handle_line(&line, &mut attempt, &mut stdin).await;
                    }
                }
                status
            }
            LoopExit::Stop => {
                self.set_state(ConnectionState::Disconnecting);
                let ctx = self.ctx.clone();
                let name = self.profile.name.clone();
                let gone = task::spawn_blocking(move || {
                    process::terminate(
                        &ctx.runner,
                        &ctx.processes,
                        pid,
                        Some(pgid),
                        &name,
                        ctx.settings.stop,
                    )
                })
                .await
                .unwrap_or(false);
                if !gone {
                    let _ = child.start_kill();
                }
                tokio::time::timeout(Duration::from_secs(1), child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok)
            }
        };
        drop(stdin);

        // never clean up while an apply for this session is still running
        if let Some(routes) = attempt.routes.take() {
            let _ = routes.await;
        }
        let routes = self.ctx.routes.clone();
        let session = self.profile.name.clone();
        let _ = task::spawn_blocking(move || routes.cleanup(&session)).await;
        self.ctx.processes.unregister(pid);
        self.emit(EventKind::Disconnected);

        if let Some(code) = status.and_then(|s| s.code()).filter(|c| *c != 0) {
            warn!("[{}] Process exited with code {}", self.name(), code);
            self.log(format!("Process exited with code {}", code));
        }
        if self.stop_requested() {
            return Ok(AttemptEnd::Stopped);
        }
        if attempt.missing_agent && !attempt.connected {
            return Err(SessionError::LaunchFailure {
                command: program.clone(),
                source: std::io::Error::other("no authentication agent found"),
            });
        }
        Ok(AttemptEnd::Exited {
            connected: attempt.connected,
        })
    }

    async fn handle_line(
        &self,
        line: &str,
        attempt: &mut Attempt,
        stdin: &mut Option<ChildStdin>,
    ) {
        debug!("[{}] {}", self.name(), line);
        self.log(line);

        for event in classify(line, self.profile.auth_mode) {
            match event {
                OutputEvent::InterfaceAnnounced(interface) => {
                    if attempt.interface.is_none() {
                        info!("[{}] Tunnel interface {}", self.name(), interface);
                        attempt.interface = Some(interface);
                    }
                }
                OutputEvent::DnsServer(server) => {
                    if !attempt.dns_servers.contains(&server) {
                        info!(
                            "[{}] Using tunnel DNS server {} for route resolution",
                            self.name(),
                            server
                        );
                        attempt.dns_servers.push(server);
                    }
                }
                OutputEvent::TunnelEstablished => {
                    if !attempt.connected {
                        attempt.connected = true;
                        self.set_state(ConnectionState::Connected);
                        self.emit(EventKind::Connected);
                        attempt.routes = self.start_routes(attempt);
                    }
                }
                OutputEvent::AuthUrl(url) => {
                    self.authenticating(attempt);
                    if !attempt.browser_launched {
                        attempt.browser_launched = true;
                        self.log(format!("Opening browser for SAML: {}", url));
                        let browser = self.ctx.browser.clone();
                        let key = self.profile.browser.clone();
                        let profile = self.profile.browser_profile.clone();
                        task::spawn_blocking(move || {
                            browser.open_url(key.as_deref(), profile.as_deref(), &url)
                        });
                    }
                }
                OutputEvent::PasswordPrompt => {
                    self.authenticating(attempt);
                    if !attempt.password_sent {
                        attempt.password_sent = true;
                        match &self.password {
                            Some(password) => {
                                if !write_line(stdin, password).await {
                                    warn!("[{}] Failed to send VPN password", self.name());
                                }
                            }
                            None => {
                                warn!("[{}] VPN password requested but none available", self.name());
                                self.log("VPN password requested but none available");
                            }
                        }
                    }
                }
                OutputEvent::AuthFailure => {
                    warn!("[{}] Authentication failed", self.name());
                    self.log("Authentication failed. You may be prompted again.");
                    self.ctx.runner.clear_credential();
                }
                OutputEvent::MissingAuthAgent => {
                    attempt.missing_agent = true;
                    if self.ctx.runner.disable_helper() {
                        self.log("No polkit authentication agent, the next attempt uses sudo");
                    }
                }
            }
        }
    }

    fn authenticating(&self, attempt: &mut Attempt) {
        if !attempt.authenticating && !attempt.connected {
            attempt.authenticating = true;
            self.set_state(ConnectionState::Authenticating);
        }
    }

    /// Apply the profile's routes in the background.
    fn start_routes(&self, attempt: &Attempt) -> Option<JoinHandle<()>> {
        if self.profile.route_targets.is_empty() {
            return None;
        }
        let routes = self.ctx.routes.clone();
        let session = self.profile.name.clone();
        let targets = self.profile.route_targets.clone();
        let interface = self
            .profile
            .interface
            .clone()
            .or_else(|| attempt.interface.clone());
        let dns_servers = attempt.dns_servers.clone();
        Some(task::spawn_blocking(move || {
            let applied = routes.apply_routes(&session, &targets, interface.as_deref(), &dns_servers);
            info!("[{}] Applied {} custom route(s)", session, applied.len());
        }))
    }

    /// Kill whatever the profile left behind and reverse its routes.
    async fn cleanup_after_stop(&self) {
        let ctx = self.ctx.clone();
        let profile = self.profile.clone();
        let signature = self.signature.clone();
        let _ = task::spawn_blocking(move || {
            process::cleanup_profile(
                &ctx.runner,
                &ctx.processes,
                ctx.scanner.as_ref(),
                &profile,
                signature.as_deref(),
                ctx.settings.stop,
            );
            ctx.routes.cleanup(&profile.name);
        })
        .await;
    }
}

async fn forward<R: AsyncRead + Unpin>(
    stream: usize,
    mut reader: R,
    tx: mpsc::Sender<(usize, Vec<u8>)>,
) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_line(stdin: &mut Option<ChildStdin>, text: &str) -> bool {
    let Some(pipe) = stdin.as_mut() else {
        return false;
    };
    let mut data = Vec::with_capacity(text.len() + 1);
    data.extend_from_slice(text.as_bytes());
    data.push(b'\n');
    if let Err(e) = pipe.write_all(&data).await {
        debug!("stdin write failed: {}", e);
        return false;
    }
    pipe.flush().await.is_ok()
}
