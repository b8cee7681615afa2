//! Registry of active connections, keyed by profile name

use crate::privilege::lock;
use crate::profile::ConnectionProfile;
use crate::routing::{parse_target, Target};
use crate::supervisor::process::{self, find_untracked, pgid_of};
use crate::supervisor::{
    ConnectionState, ProcessInfo, ProcessRegistry, ProcessScanner, SessionEvent, Supervisor,
    SupervisorContext, SupervisorHandle,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task;
use tracing::{debug, info, warn};

/// Capacity of the shared event channel
pub const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{0} is already connected")]
    AlreadyConnected(String),
    #[error("{0} is not connected")]
    NotConnected(String),
}

pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: SupervisorContext,
    sessions: Mutex<HashMap<String, SupervisorHandle>>,
    /// Last state of supervisors that ended
    finished: Mutex<HashMap<String, ConnectionState>>,
    known: Mutex<Vec<ConnectionProfile>>,
}

impl ConnectionRegistry {
    pub fn new(ctx: SupervisorContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                sessions: Mutex::new(HashMap::new()),
                finished: Mutex::new(HashMap::new()),
                known: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.ctx.events.subscribe()
    }

    /// Profiles whose leftover processes `reconcile_orphans` may terminate.
    pub fn set_known_profiles(&self, profiles: Vec<ConnectionProfile>) {
        *lock(&self.inner.known) = profiles;
    }

    /// Start supervising `profile`. `password` is sent when the tunnel asks
    /// for one.
    pub async fn connect(
        &self,
        profile: ConnectionProfile,
        password: Option<String>,
    ) -> Result<(), RegistryError> {
        let inner = &self.inner;
        inner.prune();
        let name = profile.name.clone();
        if lock(&inner.sessions).contains_key(&name) {
            return Err(RegistryError::AlreadyConnected(name));
        }
        inner.warn_overlaps(&profile);
        inner.remember(&profile);

        // leftovers of an earlier run would fight over the same routes
        let ctx = inner.ctx.clone();
        let stale = profile.clone();
        let _ = task::spawn_blocking(move || {
            process::cleanup_profile(
                &ctx.runner,
                &ctx.processes,
                ctx.scanner.as_ref(),
                &stale,
                None,
                ctx.settings.stop,
            )
        })
        .await;

        let mut sessions = lock(&inner.sessions);
        if sessions.contains_key(&name) {
            return Err(RegistryError::AlreadyConnected(name));
        }
        info!("[{}] Connecting to {}", name, profile.host);
        let handle = Supervisor::spawn(inner.ctx.clone(), profile, password);
        let mut state = handle.subscribe_state();
        sessions.insert(name.clone(), handle);
        lock(&inner.finished).remove(&name);
        drop(sessions);

        // the supervisor drops its state sender when its task ends
        let watcher = self.inner.clone();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {}
            watcher.ended_on_its_own(&name).await;
        });
        Ok(())
    }

    /// Stop the session of `name` and wait until its teardown finished.
    pub async fn disconnect(&self, name: &str) -> Result<(), RegistryError> {
        let handle = lock(&self.inner.sessions)
            .remove(name)
            .ok_or_else(|| RegistryError::NotConnected(name.to_string()))?;
        info!("[{}] Disconnecting", name);
        handle.stop();
        let state = handle.join().await;
        lock(&self.inner.finished).insert(name.to_string(), state);
        self.inner.after_session_end().await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let handles: Vec<(String, SupervisorHandle)> =
            lock(&self.inner.sessions).drain().collect();
        if handles.is_empty() {
            return;
        }
        info!("Disconnecting {} connection(s)", handles.len());
        for (_, handle) in &handles {
            handle.stop();
        }
        for (name, handle) in handles {
            let state = handle.join().await;
            lock(&self.inner.finished).insert(name, state);
        }
        self.inner.after_session_end().await;
    }

    /// Current state of `name`; `Idle` for profiles never connected.
    pub fn status(&self, name: &str) -> ConnectionState {
        if let Some(handle) = lock(&self.inner.sessions).get(name) {
            return handle.state();
        }
        lock(&self.inner.finished)
            .get(name)
            .copied()
            .unwrap_or(ConnectionState::Idle)
    }

    /// Names of profiles with a running supervisor
    pub fn active(&self) -> Vec<String> {
        self.inner.prune();
        let mut names: Vec<String> = lock(&self.inner.sessions).keys().cloned().collect();
        names.sort();
        names
    }

    /// Terminate tunnel processes of known profiles that nothing tracks.
    ///
    /// Returns how many were stopped.
    pub async fn reconcile_orphans(&self) -> usize {
        self.inner.reconcile_orphans().await
    }
}

impl Inner {
    async fn reconcile_orphans(&self) -> usize {
        let profiles = lock(&self.known).clone();
        if profiles.is_empty() {
            return 0;
        }
        let ctx = self.ctx.clone();
        task::spawn_blocking(move || {
            let mut stopped = 0;
            for (profile, orphan) in
                discover_untracked(ctx.scanner.as_ref(), &ctx.processes, &profiles)
            {
                warn!(
                    "[{}] Terminating orphaned tunnel process {}: {}",
                    profile,
                    orphan.pid,
                    orphan.cmdline.join(" ")
                );
                if process::terminate(
                    &ctx.runner,
                    &ctx.processes,
                    orphan.pid,
                    pgid_of(orphan.pid),
                    &profile,
                    ctx.settings.stop,
                ) {
                    stopped += 1;
                }
            }
            stopped
        })
        .await
        .unwrap_or(0)
    }

    fn remember(&self, profile: &ConnectionProfile) {
        let mut known = lock(&self.known);
        match known.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => *existing = profile.clone(),
            None => known.push(profile.clone()),
        }
    }

    /// Drop handles whose task ended on its own, keeping their last state.
    fn prune(&self) {
        let mut sessions = lock(&self.sessions);
        let ended: Vec<String> = sessions
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        for name in ended {
            if let Some(handle) = sessions.remove(&name) {
                debug!("[{}] Supervisor ended with {}", name, handle.state());
                lock(&self.finished).insert(name, handle.state());
            }
        }
    }

    /// Called once the supervisor of `name` is gone. A session removed by
    /// `disconnect` was already handled there.
    async fn ended_on_its_own(&self, name: &str) {
        let handle = {
            let mut sessions = lock(&self.sessions);
            let ended = sessions.get(name).is_some_and(|h| h.is_finished());
            if ended { sessions.remove(name) } else { None }
        };
        let Some(handle) = handle else {
            return;
        };
        info!("[{}] Connection ended with {}", name, handle.state());
        lock(&self.finished).insert(name.to_string(), handle.state());
        self.after_session_end().await;
    }

    async fn after_session_end(&self) {
        self.prune();
        let idle = lock(&self.sessions).is_empty();
        if !idle {
            return;
        }
        if !self.ctx.runner.reuse_allowed() {
            self.ctx.runner.clear_credential();
        }
        let stopped = self.reconcile_orphans().await;
        if stopped > 0 {
            info!("Stopped {} orphaned tunnel process(es)", stopped);
        }
    }

    fn warn_overlaps(&self, profile: &ConnectionProfile) {
        let wanted = normalized_targets(profile);
        if wanted.is_empty() {
            return;
        }
        for (name, handle) in lock(&self.sessions).iter() {
            let shared: Vec<String> = normalized_targets(handle.profile())
                .intersection(&wanted)
                .cloned()
                .collect();
            if !shared.is_empty() {
                warn!(
                    "[{}] Route targets {:?} overlap with active connection {}",
                    profile.name, shared, name
                );
            }
        }
    }
}

/// Canonical form of every parseable route target of `profile`.
fn normalized_targets(profile: &ConnectionProfile) -> BTreeSet<String> {
    profile
        .route_targets
        .iter()
        .filter_map(|raw| match parse_target(raw) {
            Ok(Target::Network(destination)) => Some(destination.to_string()),
            Ok(Target::Host(host)) => Some(host.to_lowercase()),
            Err(_) => None,
        })
        .collect()
}

/// Running tunnel processes of `profiles` that `registry` does not track,
/// paired with the owning profile name.
pub fn discover_untracked(
    scanner: &dyn ProcessScanner,
    registry: &ProcessRegistry,
    profiles: &[ConnectionProfile],
) -> Vec<(String, ProcessInfo)> {
    let mut seen = BTreeSet::new();
    let mut found = Vec::new();
    for profile in profiles {
        for orphan in find_untracked(scanner, registry, profile, &[]) {
            if seen.insert(orphan.pid) {
                found.push((profile.name.clone(), orphan));
            }
        }
    }
    found
}
