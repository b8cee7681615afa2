//! Route reconciliation for split-tunnel sessions
//!
//! Each session (keyed by profile name) forces its route targets through its
//! tunnel interface with a metric 0 override. Whatever the kernel had for the
//! same destination is evicted first and remembered, so that cleanup can put
//! it back exactly as it was. Apply and cleanup are serialized on one lock
//! because they read and mutate the shared kernel table.

pub mod resolve;
pub mod table;

pub use resolve::{parse_target, resolve_target, Destination, Target};
pub use table::{AddressFamily, LinuxRouteTable, RouteEntry, RouteTable};

use crate::privilege::{lock, CommandOutput, PrivilegeError};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use table::{ip_route, is_tunnel_interface};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Metric of the override route, lower than anything a DHCP client installs
pub const OVERRIDE_METRIC: u32 = 0;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Invalid route target: {0:?}")]
    InvalidTarget(String),
    #[error("DNS resolution failed for {host}: {source}")]
    DnsError {
        host: String,
        source: std::io::Error,
    },
    #[error("No IP addresses found for host: {0}")]
    NoAddressFound(String),
    #[error("DNS query failed: {0}")]
    DnsQueryFailed(String),
    #[error("Route command failed: {0}")]
    CommandFailed(String),
    #[error("Privilege error: {0}")]
    Privilege(#[from] PrivilegeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Polling bounds for the tunnel interface
#[derive(Debug, Clone)]
pub struct RouteSettings {
    /// Polls for a new tunnel interface when none was announced
    pub detect_attempts: u32,
    pub detect_interval: Duration,
    /// Polls for an announced interface to show up in the OS
    pub appear_attempts: u32,
    pub appear_interval: Duration,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            detect_attempts: 30,
            detect_interval: Duration::from_secs(1),
            appear_attempts: 10,
            appear_interval: Duration::from_millis(500),
        }
    }
}

/// An override route installed for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRoute {
    /// Normalized CIDR
    pub destination: String,
    pub interface: String,
    pub family: AddressFamily,
    /// Whether existing routes were evicted to install the override
    pub replaced: bool,
    /// The preferred (lowest metric) route that existed before
    pub previous: Option<RouteEntry>,
    /// Every other same-destination route that was evicted
    pub removed_duplicates: Vec<RouteEntry>,
}

impl AppliedRoute {
    /// Captured entries in restoration order
    fn captured(&self) -> impl Iterator<Item = &RouteEntry> {
        self.previous.iter().chain(self.removed_duplicates.iter())
    }

    fn override_command(&self, action: &str) -> Vec<String> {
        override_command(action, &self.destination, &self.interface, self.family)
    }
}

#[derive(Debug, Clone)]
struct PendingRestore {
    family: AddressFamily,
    entry: RouteEntry,
}

#[derive(Debug)]
struct SessionRoutes {
    interface: String,
    routes: Vec<AppliedRoute>,
}

#[derive(Debug, Default)]
struct ReconcilerState {
    sessions: HashMap<String, SessionRoutes>,
    pending: HashMap<String, Vec<PendingRestore>>,
    /// Interfaces that existed before the session's tunnel was launched
    baselines: HashMap<String, Vec<String>>,
}

pub struct RouteReconciler {
    table: Arc<dyn RouteTable>,
    settings: RouteSettings,
    state: Mutex<ReconcilerState>,
}

impl RouteReconciler {
    pub fn new(table: Arc<dyn RouteTable>, settings: RouteSettings) -> Self {
        Self {
            table,
            settings,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    /// Remember the interfaces present right now, before `session` launches
    /// its tunnel. Interface detection for the session then only accepts
    /// interfaces that are not in this snapshot.
    pub fn record_interface_baseline(&self, session: &str) {
        let interfaces = self.table.interfaces();
        debug!("[{}] Interfaces before launch: {:?}", session, interfaces);
        lock(&self.state)
            .baselines
            .insert(session.to_string(), interfaces);
    }

    /// Route `targets` through the session's tunnel interface.
    ///
    /// Blocks while waiting for the interface and while resolving hostnames.
    /// Targets that fail to resolve or install are logged and skipped.
    /// Returns the routes installed by this call.
    pub fn apply_routes(
        &self,
        session: &str,
        targets: &[String],
        interface_hint: Option<&str>,
        dns_servers: &[IpAddr],
    ) -> Vec<AppliedRoute> {
        if targets.is_empty() {
            return Vec::new();
        }

        let interface = match interface_hint {
            Some(hint) => {
                if !self.wait_for_interface(hint) {
                    warn!(
                        "[{}] Interface {} did not come up, skipping custom routes",
                        session, hint
                    );
                    return Vec::new();
                }
                hint.to_string()
            }
            None => match self.detect_interface(session) {
                Some(found) => {
                    info!("[{}] Detected tunnel interface {}", session, found);
                    found
                }
                None => {
                    warn!(
                        "[{}] No tunnel interface appeared, skipping custom routes",
                        session
                    );
                    return Vec::new();
                }
            },
        };

        let mut destinations: Vec<Destination> = Vec::new();
        for target in targets {
            match resolve_target(target, dns_servers) {
                Ok(resolved) => {
                    for destination in resolved {
                        if !destinations.contains(&destination) {
                            destinations.push(destination);
                        }
                    }
                }
                Err(e) => warn!("[{}] Skipping route target {:?}: {}", session, target, e),
            }
        }

        let mut state = lock(&self.state);
        // overrides of other sessions are never captured as a previous route
        let claimed: Vec<String> = state
            .sessions
            .iter()
            .filter(|(name, _)| name.as_str() != session)
            .map(|(_, s)| s.interface.clone())
            .collect();
        let entry = state
            .sessions
            .entry(session.to_string())
            .or_insert_with(|| SessionRoutes {
                interface: interface.clone(),
                routes: Vec::new(),
            });
        entry.interface = interface.clone();

        let mut applied = Vec::new();
        for destination in destinations {
            let key = destination.to_string();
            if entry.routes.iter().any(|r| r.destination == key) {
                debug!("[{}] Route for {} already applied", session, key);
                continue;
            }
            match self.install(session, &destination, &interface, &claimed) {
                Ok(route) => {
                    info!("[{}] Routed {} via {}", session, key, interface);
                    entry.routes.push(route.clone());
                    applied.push(route);
                }
                Err(e) => warn!("[{}] Failed to route {}: {}", session, key, e),
            }
        }
        applied
    }

    /// Remove the session's overrides and restore what they displaced.
    ///
    /// Safe to call repeatedly and for sessions that never applied anything.
    /// Restorations that fail are retried by the next cleanup of the session.
    pub fn cleanup(&self, session: &str) {
        let mut state = lock(&self.state);
        state.baselines.remove(session);
        let mut failed: Vec<PendingRestore> = Vec::new();

        let pending = state.pending.remove(session).unwrap_or_default();
        if !pending.is_empty() {
            info!(
                "[{}] Retrying {} pending route restoration(s)",
                session,
                pending.len()
            );
            let up = self.table.interfaces();
            for restore in pending {
                if !self.restore_entry(session, &restore, &up) {
                    failed.push(restore);
                }
            }
        }

        let Some(removed) = state.sessions.remove(session) else {
            if !failed.is_empty() {
                state.pending.insert(session.to_string(), failed);
            }
            return;
        };

        let mut families = BTreeSet::new();
        for route in &removed.routes {
            self.remove_override(session, route);
            families.insert(route.family.number());
        }
        for family in families {
            let family = if family == 6 {
                AddressFamily::V6
            } else {
                AddressFamily::V4
            };
            let mut args = ip_route("flush", family);
            args.push("cache".to_string());
            if let Err(e) = self.table.execute(&args) {
                debug!("[{}] Route cache flush failed: {}", session, e);
            }
        }

        let up = self.table.interfaces();
        for route in removed.routes {
            // (a) another live session still wants this destination
            let handoff = state.sessions.iter_mut().find(|(_, other)| {
                up.contains(&other.interface)
                    && other.routes.iter().any(|r| r.destination == route.destination)
            });
            if let Some((other_name, other)) = handoff {
                let args = override_command(
                    "replace",
                    &route.destination,
                    &other.interface,
                    route.family,
                );
                match self.table.execute(&args) {
                    Ok(output) if output.success() => {
                        info!(
                            "[{}] Handed {} over to {} via {}",
                            session, route.destination, other_name, other.interface
                        );
                        let interface = other.interface.clone();
                        if let Some(target) = other
                            .routes
                            .iter_mut()
                            .find(|r| r.destination == route.destination)
                        {
                            for entry in route.captured() {
                                if entry.dev.as_deref() != Some(interface.as_str())
                                    && !target.captured().any(|e| e == entry)
                                {
                                    target.removed_duplicates.push(entry.clone());
                                }
                            }
                        }
                        continue;
                    }
                    Ok(output) => warn!(
                        "[{}] Handover of {} to {} failed: {}",
                        session,
                        route.destination,
                        other_name,
                        output.message()
                    ),
                    Err(e) => warn!(
                        "[{}] Handover of {} to {} failed: {}",
                        session, route.destination, other_name, e
                    ),
                }
            }

            // (b) reinstall what was there before
            let mut restored_any = false;
            for entry in route.captured() {
                restored_any = true;
                let restore = PendingRestore {
                    family: route.family,
                    entry: entry.clone(),
                };
                if !self.restore_entry(session, &restore, &up) {
                    failed.push(restore);
                }
            }

            // (c) nothing to go back to
            if !restored_any {
                info!(
                    "[{}] No previous route for {}, leaving it unrouted",
                    session, route.destination
                );
            }
        }

        if !failed.is_empty() {
            warn!(
                "[{}] {} route restoration(s) queued for retry",
                session,
                failed.len()
            );
            state.pending.insert(session.to_string(), failed);
        }
    }

    /// Routes currently applied for `session`
    pub fn applied_routes(&self, session: &str) -> Vec<AppliedRoute> {
        lock(&self.state)
            .sessions
            .get(session)
            .map(|s| s.routes.clone())
            .unwrap_or_default()
    }

    /// Restorations that failed and will be retried on the next cleanup
    pub fn pending_restorations(&self, session: &str) -> Vec<RouteEntry> {
        lock(&self.state)
            .pending
            .get(session)
            .map(|p| p.iter().map(|r| r.entry.clone()).collect())
            .unwrap_or_default()
    }

    fn wait_for_interface(&self, name: &str) -> bool {
        for attempt in 0..self.settings.appear_attempts.max(1) {
            if self.table.interfaces().iter().any(|i| i == name) {
                return true;
            }
            debug!("Waiting for interface {} (attempt {})", name, attempt + 1);
            thread::sleep(self.settings.appear_interval);
        }
        false
    }

    /// Find a tunnel interface not already owned by another session and,
    /// when a baseline was recorded, not present before the launch.
    fn detect_interface(&self, session: &str) -> Option<String> {
        for _ in 0..self.settings.detect_attempts.max(1) {
            let (claimed, baseline) = {
                let state = lock(&self.state);
                let claimed: Vec<String> = state
                    .sessions
                    .iter()
                    .filter(|(name, _)| name.as_str() != session)
                    .map(|(_, s)| s.interface.clone())
                    .collect();
                (claimed, state.baselines.get(session).cloned().unwrap_or_default())
            };
            let found = self.table.interfaces().into_iter().find(|i| {
                is_tunnel_interface(i) && !claimed.contains(i) && !baseline.contains(i)
            });
            if found.is_some() {
                return found;
            }
            thread::sleep(self.settings.detect_interval);
        }
        None
    }

    fn install(
        &self,
        session: &str,
        destination: &Destination,
        interface: &str,
        claimed: &[String],
    ) -> Result<AppliedRoute, RouteError> {
        let family = destination.family();
        let key = destination.to_string();

        let mut removed = Vec::new();
        self.evict(session, destination, interface, claimed, &mut removed);

        let add = override_command("add", &key, interface, family);
        let result = self.table.execute(&add).and_then(|output| {
            if output.success() || !output.message().contains("File exists") {
                return Ok(output);
            }
            debug!("[{}] {} reappeared, evicting again", session, key);
            self.evict(session, destination, interface, claimed, &mut removed);
            self.table.execute(&add)
        });

        let failure = match result {
            Ok(output) if output.success() => None,
            Ok(output) => Some(RouteError::CommandFailed(format!(
                "{}: {}",
                add.join(" "),
                output.message()
            ))),
            Err(e) => Some(e),
        };
        if let Some(e) = failure {
            let up = self.table.interfaces();
            for entry in &removed {
                let restore = PendingRestore {
                    family,
                    entry: entry.clone(),
                };
                self.restore_entry(session, &restore, &up);
            }
            return Err(e);
        }

        match self.table.route_device(destination) {
            Some(dev) if dev == interface => debug!("[{}] {} resolves via {}", session, key, dev),
            Some(dev) => warn!(
                "[{}] {} still resolves via {} instead of {}",
                session, key, dev, interface
            ),
            None => warn!("[{}] Could not verify route for {}", session, key),
        }

        removed.sort_by_key(|e| e.metric.unwrap_or(0));
        let mut removed = removed.into_iter();
        let previous = removed.next();
        Ok(AppliedRoute {
            destination: key,
            interface: interface.to_string(),
            family,
            replaced: previous.is_some(),
            previous,
            removed_duplicates: removed.collect(),
        })
    }

    /// Delete every route for exactly `destination`, recording the ones that
    /// do not belong to `interface`. Overrides on a `claimed` interface belong
    /// to another session and are deleted without being recorded.
    fn evict(
        &self,
        session: &str,
        destination: &Destination,
        interface: &str,
        claimed: &[String],
        removed: &mut Vec<RouteEntry>,
    ) {
        let key = destination.to_string();
        let existing = match self.table.query(destination) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[{}] Could not read routes for {}: {}", session, key, e);
                return;
            }
        };

        for entry in existing {
            let same = entry.destination == key
                || (entry.destination == "default" && destination.prefix() == 0);
            if !same {
                continue;
            }
            match self.table.execute(&entry.command("del", destination.family())) {
                Ok(output) if output.success() => {
                    debug!("[{}] Evicted {}", session, entry);
                    let foreign_override = entry.metric.unwrap_or(0) == OVERRIDE_METRIC
                        && entry.dev.as_ref().is_some_and(|dev| claimed.contains(dev));
                    if entry.dev.as_deref() != Some(interface)
                        && !foreign_override
                        && !removed.contains(&entry)
                    {
                        removed.push(entry);
                    }
                }
                Ok(output) => warn!(
                    "[{}] Could not evict {}: {}",
                    session,
                    entry,
                    output.message()
                ),
                Err(e) => warn!("[{}] Could not evict {}: {}", session, entry, e),
            }
        }
    }

    fn remove_override(&self, session: &str, route: &AppliedRoute) {
        let output = match self.table.execute(&route.override_command("del")) {
            Ok(output) => output,
            Err(e) => {
                warn!("[{}] Failed to remove route {}: {}", session, route.destination, e);
                return;
            }
        };
        if output.success() || route_already_gone(&output) {
            debug!("[{}] Removed route {}", session, route.destination);
            return;
        }
        if device_missing(&output) {
            // interface already torn down, delete by destination alone
            let mut args = ip_route("del", route.family);
            args.extend([
                route.destination.clone(),
                "metric".to_string(),
                OVERRIDE_METRIC.to_string(),
            ]);
            match self.table.execute(&args) {
                Ok(output) if output.success() || route_already_gone(&output) => {
                    debug!("[{}] Removed route {}", session, route.destination);
                }
                Ok(output) => warn!(
                    "[{}] Failed to remove route {}: {}",
                    session,
                    route.destination,
                    output.message()
                ),
                Err(e) => warn!("[{}] Failed to remove route {}: {}", session, route.destination, e),
            }
            return;
        }
        warn!(
            "[{}] Failed to remove route {}: {}",
            session,
            route.destination,
            output.message()
        );
    }

    fn restore_entry(&self, session: &str, restore: &PendingRestore, up: &[String]) -> bool {
        if let Some(dev) = restore.entry.dev.as_deref()
            && is_tunnel_interface(dev)
            && !up.iter().any(|i| i == dev)
        {
            debug!("[{}] Not restoring {}, {} is gone", session, restore.entry, dev);
            return true;
        }
        match self
            .table
            .execute(&restore.entry.command("replace", restore.family))
        {
            Ok(output) if output.success() => {
                info!("[{}] Restored {}", session, restore.entry);
                true
            }
            Ok(output) => {
                warn!(
                    "[{}] Failed to restore {}: {}",
                    session,
                    restore.entry,
                    output.message()
                );
                false
            }
            Err(e) => {
                warn!("[{}] Failed to restore {}: {}", session, restore.entry, e);
                false
            }
        }
    }
}

/// `ip [-6] route <action> <dest> dev <iface> metric 0`
fn override_command(
    action: &str,
    destination: &str,
    interface: &str,
    family: AddressFamily,
) -> Vec<String> {
    let mut args = ip_route(action, family);
    args.extend([
        destination.to_string(),
        "dev".to_string(),
        interface.to_string(),
        "metric".to_string(),
        OVERRIDE_METRIC.to_string(),
    ]);
    args
}

fn device_missing(output: &CommandOutput) -> bool {
    let message = output.message();
    message.contains("Cannot find device") || message.contains("No such device")
}

fn route_already_gone(output: &CommandOutput) -> bool {
    output.message().contains("No such process")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory kernel table that understands the `ip route` commands we issue.
    #[derive(Default)]
    pub(crate) struct FakeRouteTable {
        routes: Mutex<Vec<(AddressFamily, RouteEntry)>>,
        interfaces: Mutex<Vec<String>>,
        commands: Mutex<Vec<String>>,
        pub fail_add: AtomicBool,
        pub fail_replace: AtomicBool,
    }

    impl FakeRouteTable {
        pub(crate) fn new(interfaces: &[&str]) -> Arc<Self> {
            let table = Self::default();
            *table.interfaces.lock().unwrap() = interfaces.iter().map(|s| s.to_string()).collect();
            Arc::new(table)
        }

        pub(crate) fn with_route(self: Arc<Self>, line: &str) -> Arc<Self> {
            let family = if line.contains(':') {
                AddressFamily::V6
            } else {
                AddressFamily::V4
            };
            let entry = RouteEntry::parse(line, family).unwrap();
            self.routes.lock().unwrap().push((family, entry));
            self
        }

        pub(crate) fn set_interfaces(&self, interfaces: &[&str]) {
            *self.interfaces.lock().unwrap() = interfaces.iter().map(|s| s.to_string()).collect();
        }

        pub(crate) fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        pub(crate) fn routes(&self) -> Vec<String> {
            self.routes
                .lock()
                .unwrap()
                .iter()
                .map(|(_, e)| e.to_string())
                .collect()
        }

        fn fail(code: i32, stderr: &str) -> CommandOutput {
            CommandOutput {
                code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }
        }
    }

    impl RouteTable for FakeRouteTable {
        fn query(&self, destination: &Destination) -> Result<Vec<RouteEntry>, RouteError> {
            let key = destination.to_string();
            Ok(self
                .routes
                .lock()
                .unwrap()
                .iter()
                .filter(|(f, e)| *f == destination.family() && e.destination == key)
                .map(|(_, e)| e.clone())
                .collect())
        }

        fn execute(&self, args: &[String]) -> Result<CommandOutput, RouteError> {
            self.commands.lock().unwrap().push(args.join(" "));

            let mut rest = &args[1..];
            let family = if rest[0] == "-6" {
                rest = &rest[1..];
                AddressFamily::V6
            } else {
                AddressFamily::V4
            };
            let action = rest[1].as_str();
            if action == "flush" {
                return Ok(CommandOutput::default());
            }
            let entry = RouteEntry::parse(&rest[2..].join(" "), family).unwrap();
            let interfaces = self.interfaces.lock().unwrap().clone();
            if let Some(dev) = &entry.dev
                && !interfaces.contains(dev)
            {
                return Ok(Self::fail(1, &format!("Cannot find device \"{}\"", dev)));
            }

            let mut routes = self.routes.lock().unwrap();
            let metric = entry.metric.unwrap_or(0);
            let same_slot = |(f, e): &(AddressFamily, RouteEntry)| {
                *f == family && e.destination == entry.destination && e.metric.unwrap_or(0) == metric
            };
            match action {
                "add" => {
                    if self.fail_add.load(Ordering::SeqCst) {
                        return Ok(Self::fail(2, "RTNETLINK answers: Network is unreachable"));
                    }
                    if routes.iter().any(same_slot) {
                        return Ok(Self::fail(2, "RTNETLINK answers: File exists"));
                    }
                    routes.push((family, entry));
                }
                "replace" => {
                    if self.fail_replace.load(Ordering::SeqCst) {
                        return Ok(Self::fail(2, "RTNETLINK answers: Network is unreachable"));
                    }
                    routes.retain(|r| !same_slot(r));
                    routes.push((family, entry));
                }
                "del" => {
                    let position = routes.iter().position(|(f, e)| {
                        *f == family
                            && e.destination == entry.destination
                            && (entry.dev.is_none() || e.dev == entry.dev)
                            && (entry.via.is_none() || e.via == entry.via)
                            && (entry.metric.is_none() || e.metric.unwrap_or(0) == metric)
                    });
                    match position {
                        Some(i) => {
                            routes.remove(i);
                        }
                        None => return Ok(Self::fail(2, "RTNETLINK answers: No such process")),
                    }
                }
                other => panic!("unexpected route action {}", other),
            }
            Ok(CommandOutput::default())
        }

        fn route_device(&self, destination: &Destination) -> Option<String> {
            let key = destination.to_string();
            self.routes
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, e)| e.destination == key)
                .min_by_key(|(_, e)| e.metric.unwrap_or(0))
                .and_then(|(_, e)| e.dev.clone())
        }

        fn interfaces(&self) -> Vec<String> {
            self.interfaces.lock().unwrap().clone()
        }
    }

    pub(crate) fn quick_settings() -> RouteSettings {
        RouteSettings {
            detect_attempts: 2,
            detect_interval: Duration::from_millis(1),
            appear_attempts: 2,
            appear_interval: Duration::from_millis(1),
        }
    }

    fn reconciler(table: &Arc<FakeRouteTable>) -> RouteReconciler {
        RouteReconciler::new(table.clone(), quick_settings())
    }

    fn targets(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_apply_and_cleanup_cidr() {
        let table = FakeRouteTable::new(&["lo", "eth0", "ppp0"]);
        let routes = reconciler(&table);

        let applied = routes.apply_routes(
            "corp",
            &targets(&["10.1.0.0/16", "10.1.7.9/16"]),
            Some("ppp0"),
            &[],
        );

        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].destination, "10.1.0.0/16");
        assert!(!applied[0].replaced);
        assert!(table
            .commands()
            .contains(&"ip route add 10.1.0.0/16 dev ppp0 metric 0".to_string()));
        assert_eq!(table.routes(), vec!["10.1.0.0/16 dev ppp0 metric 0"]);

        routes.cleanup("corp");
        assert!(routes.applied_routes("corp").is_empty());
        assert!(table.routes().is_empty());
        assert!(table
            .commands()
            .contains(&"ip route del 10.1.0.0/16 dev ppp0 metric 0".to_string()));

        let issued = table.commands().len();
        routes.cleanup("corp");
        assert_eq!(table.commands().len(), issued);
    }

    #[test]
    fn test_host_target_normalized() {
        let table = FakeRouteTable::new(&["ppp0"]);
        let routes = reconciler(&table);

        let applied = routes.apply_routes("corp", &targets(&["192.0.2.7"]), Some("ppp0"), &[]);
        assert_eq!(applied[0].destination, "192.0.2.7/32");
        assert_eq!(applied[0].family, AddressFamily::V4);
    }

    #[test]
    fn test_ipv6_uses_family_flag() {
        let table = FakeRouteTable::new(&["ppp0"]);
        let routes = reconciler(&table);

        let applied = routes.apply_routes("corp", &targets(&["2001:db8::/32"]), Some("ppp0"), &[]);

        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].family.number(), 6);
        assert!(table
            .commands()
            .contains(&"ip -6 route add 2001:db8::/32 dev ppp0 metric 0".to_string()));

        routes.cleanup("corp");
        assert!(table
            .commands()
            .contains(&"ip -6 route del 2001:db8::/32 dev ppp0 metric 0".to_string()));
        assert!(table.commands().contains(&"ip -6 route flush cache".to_string()));
    }

    #[test]
    fn test_restoration_round_trip() {
        let table = FakeRouteTable::new(&["eth0", "ppp0"])
            .with_route("10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100");
        let routes = reconciler(&table);

        let applied = routes.apply_routes("corp", &targets(&["10.0.0.0/24"]), Some("ppp0"), &[]);
        assert!(applied[0].replaced);
        assert_eq!(
            applied[0].previous.as_ref().map(|e| e.to_string()).as_deref(),
            Some("10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100")
        );
        assert_eq!(table.routes(), vec!["10.0.0.0/24 dev ppp0 metric 0"]);

        routes.cleanup("corp");
        assert!(table.commands().contains(
            &"ip route replace 10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100".to_string()
        ));
        assert_eq!(
            table.routes(),
            vec!["10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100"]
        );
    }

    #[test]
    fn test_all_duplicates_evicted_and_restored() {
        let table = FakeRouteTable::new(&["eth0", "wlan0", "ppp0"])
            .with_route("10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100")
            .with_route("10.0.0.0/24 via 192.168.2.1 dev wlan0 metric 600");
        let routes = reconciler(&table);

        let applied = routes.apply_routes("corp", &targets(&["10.0.0.0/24"]), Some("ppp0"), &[]);
        assert_eq!(applied[0].previous.as_ref().unwrap().metric, Some(100));
        assert_eq!(applied[0].removed_duplicates.len(), 1);
        assert_eq!(applied[0].removed_duplicates[0].metric, Some(600));
        assert_eq!(table.routes().len(), 1);

        routes.cleanup("corp");
        let mut restored = table.routes();
        restored.sort();
        assert_eq!(
            restored,
            vec![
                "10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100",
                "10.0.0.0/24 via 192.168.2.1 dev wlan0 metric 600",
            ]
        );
    }

    #[test]
    fn test_cleanup_without_device_falls_back() {
        let table = FakeRouteTable::new(&["ppp0"]);
        let routes = reconciler(&table);
        routes.apply_routes("corp", &targets(&["10.1.0.0/16"]), Some("ppp0"), &[]);

        table.set_interfaces(&["eth0"]);
        routes.cleanup("corp");

        let commands = table.commands();
        let first = commands
            .iter()
            .position(|c| c == "ip route del 10.1.0.0/16 dev ppp0 metric 0")
            .unwrap();
        assert_eq!(commands[first + 1], "ip route del 10.1.0.0/16 metric 0");
        assert!(table.routes().is_empty());
    }

    #[test]
    fn test_cleanup_hands_destination_to_other_session() {
        let table = FakeRouteTable::new(&["eth0", "ppp0", "ppp1"])
            .with_route("10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100");
        let routes = reconciler(&table);

        routes.apply_routes("a", &targets(&["10.0.0.0/24"]), Some("ppp0"), &[]);
        routes.apply_routes("b", &targets(&["10.0.0.0/24"]), Some("ppp1"), &[]);
        assert_eq!(table.routes(), vec!["10.0.0.0/24 dev ppp1 metric 0"]);

        routes.cleanup("a");
        assert!(table
            .commands()
            .contains(&"ip route replace 10.0.0.0/24 dev ppp1 metric 0".to_string()));
        assert_eq!(table.routes(), vec!["10.0.0.0/24 dev ppp1 metric 0"]);

        let handed = routes.applied_routes("b");
        assert!(handed[0]
            .captured()
            .any(|e| e.dev.as_deref() == Some("eth0")));

        table.set_interfaces(&["eth0", "ppp1"]);
        routes.cleanup("b");
        assert_eq!(
            table.routes(),
            vec!["10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100"]
        );
        assert!(routes.pending_restorations("b").is_empty());
    }

    #[test]
    fn test_second_session_does_not_capture_first_override() {
        let table = FakeRouteTable::new(&["eth0", "ppp0", "ppp1"])
            .with_route("10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100");
        let routes = reconciler(&table);

        routes.apply_routes("a", &targets(&["10.0.0.0/24"]), Some("ppp0"), &[]);
        let applied = routes.apply_routes("b", &targets(&["10.0.0.0/24"]), Some("ppp1"), &[]);
        assert!(applied[0].previous.is_none());
        assert!(applied[0].removed_duplicates.is_empty());

        routes.cleanup("a");
        routes.cleanup("b");

        // ppp0 is still up, yet its override must not come back
        assert_eq!(
            table.routes(),
            vec!["10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100"]
        );
        assert!(routes.pending_restorations("a").is_empty());
        assert!(routes.pending_restorations("b").is_empty());
    }

    #[test]
    fn test_failed_restoration_is_retried() {
        let table = FakeRouteTable::new(&["eth0", "ppp0"])
            .with_route("10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100");
        let routes = reconciler(&table);
        routes.apply_routes("corp", &targets(&["10.0.0.0/24"]), Some("ppp0"), &[]);

        table.fail_replace.store(true, Ordering::SeqCst);
        routes.cleanup("corp");
        assert_eq!(routes.pending_restorations("corp").len(), 1);
        assert!(table.routes().is_empty());

        table.fail_replace.store(false, Ordering::SeqCst);
        routes.cleanup("corp");
        assert!(routes.pending_restorations("corp").is_empty());
        assert_eq!(
            table.routes(),
            vec!["10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100"]
        );
    }

    #[test]
    fn test_failed_add_restores_evicted_routes() {
        let table = FakeRouteTable::new(&["eth0", "ppp0"])
            .with_route("10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100");
        let routes = reconciler(&table);
        table.fail_add.store(true, Ordering::SeqCst);

        let applied = routes.apply_routes("corp", &targets(&["10.0.0.0/24"]), Some("ppp0"), &[]);

        assert!(applied.is_empty());
        assert_eq!(
            table.routes(),
            vec!["10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100"]
        );
    }

    #[test]
    fn test_missing_interface_skips_routes() {
        let table = FakeRouteTable::new(&["eth0"]);
        let routes = reconciler(&table);

        let applied = routes.apply_routes("corp", &targets(&["10.0.0.0/24"]), Some("ppp9"), &[]);

        assert!(applied.is_empty());
        assert!(table.commands().is_empty());
    }

    #[test]
    fn test_detects_unclaimed_tunnel_interface() {
        let table = FakeRouteTable::new(&["eth0", "ppp0", "ppp1"]);
        let routes = reconciler(&table);
        routes.apply_routes("a", &targets(&["10.0.0.0/24"]), Some("ppp0"), &[]);

        let applied = routes.apply_routes("b", &targets(&["10.9.0.0/16"]), None, &[]);

        assert_eq!(applied[0].interface, "ppp1");
    }

    #[test]
    fn test_detection_ignores_interfaces_present_before_launch() {
        let table = FakeRouteTable::new(&["eth0", "tun0"]);
        let routes = reconciler(&table);

        routes.record_interface_baseline("corp");
        assert!(routes
            .apply_routes("corp", &targets(&["10.9.0.0/16"]), None, &[])
            .is_empty());

        routes.record_interface_baseline("corp");
        table.set_interfaces(&["eth0", "tun0", "ppp0"]);
        let applied = routes.apply_routes("corp", &targets(&["10.9.0.0/16"]), None, &[]);
        assert_eq!(applied[0].interface, "ppp0");

        // cleanup forgets the baseline
        routes.cleanup("corp");
        let applied = routes.apply_routes("corp", &targets(&["10.9.0.0/16"]), None, &[]);
        assert_eq!(applied[0].interface, "tun0");
    }

    #[test]
    fn test_invalid_targets_are_skipped() {
        let table = FakeRouteTable::new(&["ppp0"]);
        let routes = reconciler(&table);

        let applied = routes.apply_routes(
            "corp",
            &targets(&["not a target", "", "10.0.0.1"]),
            Some("ppp0"),
            &[],
        );

        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].destination, "10.0.0.1/32");
    }

    #[test]
    fn test_no_targets_is_noop() {
        let table = FakeRouteTable::new(&[]);
        let routes = reconciler(&table);
        assert!(routes.apply_routes("corp", &[], None, &[]).is_empty());
        assert!(table.commands().is_empty());
    }
}
