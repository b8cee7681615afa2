//! Kernel route table access through `ip route`

use super::resolve::Destination;
use super::RouteError;
use crate::privilege::{CommandOutput, PrivilegeRunner};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::collections::BTreeSet;
use std::fmt;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Interface name prefixes used by tunnel devices
const TUNNEL_PREFIXES: [&str; 3] = ["ppp", "tun", "tap"];

/// Route types that are not plain unicast routes
const SPECIAL_ROUTE_TYPES: [&str; 8] = [
    "local",
    "broadcast",
    "unreachable",
    "prohibit",
    "blackhole",
    "throw",
    "multicast",
    "nat",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn number(self) -> u8 {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 6,
        }
    }

    fn host_prefix(self) -> u8 {
        match self {
            AddressFamily::V4 => 32,
            AddressFamily::V6 => 128,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPv{}", self.number())
    }
}

/// One line of `ip route show` output
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteEntry {
    pub destination: String,
    pub via: Option<String>,
    pub dev: Option<String>,
    pub metric: Option<u32>,
}

impl RouteEntry {
    /// Parse a single `ip route show` line. Non-unicast routes yield `None`.
    pub fn parse(line: &str, family: AddressFamily) -> Option<Self> {
        let mut tokens = line.split_whitespace().peekable();
        let first = *tokens.peek()?;
        if SPECIAL_ROUTE_TYPES.contains(&first) {
            return None;
        }
        if first == "unicast" {
            tokens.next();
        }

        let raw_destination = tokens.next()?;
        let destination = if raw_destination == "default" || raw_destination.contains('/') {
            raw_destination.to_string()
        } else {
            format!("{}/{}", raw_destination, family.host_prefix())
        };

        let mut entry = RouteEntry {
            destination,
            ..Default::default()
        };
        while let Some(key) = tokens.next() {
            match key {
                "via" => {
                    // `via inet6 <addr>` is accepted by newer iproute2
                    let mut value = tokens.next();
                    if matches!(value, Some("inet") | Some("inet6")) {
                        value = tokens.next();
                    }
                    entry.via = value.map(str::to_string);
                }
                "dev" => entry.dev = tokens.next().map(str::to_string),
                "metric" => entry.metric = tokens.next().and_then(|m| m.parse().ok()),
                _ => {}
            }
        }
        Some(entry)
    }

    /// `ip [-6] route <action> <dest> [via ..] [dev ..] [metric ..]`
    pub fn command(&self, action: &str, family: AddressFamily) -> Vec<String> {
        let mut args = ip_route(action, family);
        args.push(self.destination.clone());
        if let Some(via) = &self.via {
            args.extend(["via".to_string(), via.clone()]);
        }
        if let Some(dev) = &self.dev {
            args.extend(["dev".to_string(), dev.clone()]);
        }
        if let Some(metric) = self.metric {
            args.extend(["metric".to_string(), metric.to_string()]);
        }
        args
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(via) = &self.via {
            write!(f, " via {}", via)?;
        }
        if let Some(dev) = &self.dev {
            write!(f, " dev {}", dev)?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {}", metric)?;
        }
        Ok(())
    }
}

/// `ip route <action>` or `ip -6 route <action>`
pub fn ip_route(action: &str, family: AddressFamily) -> Vec<String> {
    let mut args = vec!["ip".to_string()];
    if family == AddressFamily::V6 {
        args.push("-6".to_string());
    }
    args.extend(["route".to_string(), action.to_string()]);
    args
}

/// Extract the `dev` of an `ip route get` answer
pub fn parse_route_get(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "dev" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

pub fn is_tunnel_interface(name: &str) -> bool {
    TUNNEL_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Kernel routing table operations needed by the reconciler
pub trait RouteTable: Send + Sync {
    /// Current routes whose destination is exactly `destination`
    fn query(&self, destination: &Destination) -> Result<Vec<RouteEntry>, RouteError>;
    /// Run a mutating `ip` command with elevated privileges
    fn execute(&self, args: &[String]) -> Result<CommandOutput, RouteError>;
    /// Device the kernel currently selects for traffic to `destination`
    fn route_device(&self, destination: &Destination) -> Option<String>;
    /// Names of the interfaces that are currently up
    fn interfaces(&self) -> Vec<String>;
}

/// `RouteTable` backed by iproute2. Reads run unprivileged, changes go
/// through the privilege runner.
pub struct LinuxRouteTable {
    runner: Arc<PrivilegeRunner>,
    timeout: Duration,
}

impl LinuxRouteTable {
    pub fn new(runner: Arc<PrivilegeRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    fn read(&self, args: &[String]) -> Result<String, RouteError> {
        let output = Command::new(&args[0]).args(&args[1..]).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RouteError::CommandFailed(format!(
                "{}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RouteTable for LinuxRouteTable {
    fn query(&self, destination: &Destination) -> Result<Vec<RouteEntry>, RouteError> {
        let family = destination.family();
        let mut args = ip_route("show", family);
        args.push(destination.to_string());
        let output = self.read(&args)?;
        Ok(output
            .lines()
            .filter_map(|line| RouteEntry::parse(line, family))
            .collect())
    }

    fn execute(&self, args: &[String]) -> Result<CommandOutput, RouteError> {
        Ok(self.runner.run_elevated(args, None, self.timeout)?)
    }

    fn route_device(&self, destination: &Destination) -> Option<String> {
        let mut args = ip_route("get", destination.family());
        args.push(destination.addr().to_string());
        match self.read(&args) {
            Ok(output) => parse_route_get(&output),
            Err(e) => {
                debug!("Route lookup for {} failed: {}", destination, e);
                None
            }
        }
    }

    fn interfaces(&self) -> Vec<String> {
        let names: BTreeSet<String> = match getifaddrs() {
            Ok(addrs) => addrs
                .filter(|a| a.flags.contains(InterfaceFlags::IFF_UP))
                .map(|a| a.interface_name)
                .collect(),
            Err(e) => {
                debug!("getifaddrs failed: {}", e);
                BTreeSet::new()
            }
        };
        names.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gateway_route() {
        let entry = RouteEntry::parse(
            "10.0.0.0/24 via 192.168.1.1 dev eth0 proto static metric 100",
            AddressFamily::V4,
        )
        .unwrap();
        assert_eq!(entry.destination, "10.0.0.0/24");
        assert_eq!(entry.via.as_deref(), Some("192.168.1.1"));
        assert_eq!(entry.dev.as_deref(), Some("eth0"));
        assert_eq!(entry.metric, Some(100));
    }

    #[test]
    fn test_parse_host_route_gets_prefix() {
        let entry =
            RouteEntry::parse("192.0.2.5 dev ppp0 scope link", AddressFamily::V4).unwrap();
        assert_eq!(entry.destination, "192.0.2.5/32");
        assert_eq!(entry.via, None);
        assert_eq!(entry.metric, None);

        let entry = RouteEntry::parse("2001:db8::1 dev tun0 metric 1024 pref medium", AddressFamily::V6)
            .unwrap();
        assert_eq!(entry.destination, "2001:db8::1/128");
        assert_eq!(entry.metric, Some(1024));
    }

    #[test]
    fn test_parse_skips_special_routes() {
        assert!(RouteEntry::parse("unreachable 10.0.0.0/8", AddressFamily::V4).is_none());
        assert!(RouteEntry::parse("", AddressFamily::V4).is_none());
        let entry = RouteEntry::parse("unicast 10.0.0.0/8 dev eth0", AddressFamily::V4).unwrap();
        assert_eq!(entry.destination, "10.0.0.0/8");
    }

    #[test]
    fn test_parse_via_inet6() {
        let entry = RouteEntry::parse(
            "10.1.0.0/16 via inet6 fe80::1 dev eth0",
            AddressFamily::V4,
        )
        .unwrap();
        assert_eq!(entry.via.as_deref(), Some("fe80::1"));
    }

    #[test]
    fn test_entry_command_round_trips_fields() {
        let entry = RouteEntry {
            destination: "10.0.0.0/24".to_string(),
            via: Some("192.168.1.1".to_string()),
            dev: Some("eth0".to_string()),
            metric: Some(100),
        };
        assert_eq!(
            entry.command("replace", AddressFamily::V4),
            vec![
                "ip", "route", "replace", "10.0.0.0/24", "via", "192.168.1.1", "dev", "eth0",
                "metric", "100"
            ]
        );
        assert_eq!(entry.to_string(), "10.0.0.0/24 via 192.168.1.1 dev eth0 metric 100");
    }

    #[test]
    fn test_ip_route_family_flag() {
        assert_eq!(ip_route("add", AddressFamily::V4), vec!["ip", "route", "add"]);
        assert_eq!(ip_route("del", AddressFamily::V6), vec!["ip", "-6", "route", "del"]);
    }

    #[test]
    fn test_parse_route_get() {
        assert_eq!(
            parse_route_get("10.0.0.1 dev ppp0 src 10.212.134.200 uid 1000\n    cache"),
            Some("ppp0".to_string())
        );
        assert_eq!(parse_route_get("RTNETLINK answers: Network is unreachable"), None);
    }

    #[test]
    fn test_tunnel_interface_names() {
        assert!(is_tunnel_interface("ppp0"));
        assert!(is_tunnel_interface("tun3"));
        assert!(!is_tunnel_interface("eth0"));
        assert!(!is_tunnel_interface("wlp2s0"));
    }
}
