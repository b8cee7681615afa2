//! Route target resolution
//!
//! Turns raw user entries (IP, CIDR, hostname, URL) into normalized CIDR
//! destinations. Hostnames are looked up through the tunnel's DNS servers
//! when the tunnel announced any, falling back to the system resolver.

use super::table::AddressFamily;
use super::RouteError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const DNS_TIMEOUT: Duration = Duration::from_secs(2);
const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;

/// A network address with an explicit prefix length; host bits are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    addr: IpAddr,
    prefix: u8,
}

impl Destination {
    /// Single-host destination (`/32` or `/128`)
    pub fn host(addr: IpAddr) -> Self {
        let prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { addr, prefix }
    }

    /// Network destination with the host bits of `addr` cleared
    pub fn network(addr: IpAddr, prefix: u8) -> Result<Self, RouteError> {
        let addr = match addr {
            IpAddr::V4(v4) if prefix <= 32 => {
                let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) if prefix <= 128 => {
                let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
            _ => {
                return Err(RouteError::InvalidTarget(format!("{}/{}", addr, prefix)));
            }
        };
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn family(&self) -> AddressFamily {
        match self.addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Destination {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RouteError::InvalidTarget(s.to_string());
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                Destination::network(addr, prefix)
            }
            None => s.parse().map(Destination::host).map_err(|_| invalid()),
        }
    }
}

/// A route target after syntactic parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Network(Destination),
    Host(String),
}

/// Parse a raw user entry without touching the network.
pub fn parse_target(raw: &str) -> Result<Target, RouteError> {
    let invalid = || RouteError::InvalidTarget(raw.to_string());
    let mut entry = raw.trim().to_string();
    if entry.is_empty() {
        return Err(invalid());
    }

    if entry.contains("://") {
        let url = Url::parse(&entry).map_err(|_| invalid())?;
        let host = url.host_str().ok_or_else(invalid)?;
        entry = host.trim_start_matches('[').trim_end_matches(']').to_string();
    } else if entry.starts_with('[') {
        // [v6] or [v6]:port
        let end = entry.find(']').ok_or_else(invalid)?;
        entry = entry[1..end].to_string();
    } else if entry.matches(':').count() == 1 {
        // host:port or v4:port
        if let Some((host, _port)) = entry.split_once(':') {
            entry = host.to_string();
        }
    }

    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok(Target::Network(Destination::host(ip)));
    }
    if entry.contains('/') {
        return entry.parse().map(Target::Network);
    }
    if entry.is_empty() || entry.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(Target::Host(entry))
}

/// Resolve a raw user entry to one or more destinations.
pub fn resolve_target(raw: &str, dns_servers: &[IpAddr]) -> Result<Vec<Destination>, RouteError> {
    match parse_target(raw)? {
        Target::Network(destination) => Ok(vec![destination]),
        Target::Host(hostname) => {
            let mut destinations: Vec<Destination> = Vec::new();
            for ip in resolve_hostname(&hostname, dns_servers)? {
                let destination = Destination::host(ip);
                if !destinations.contains(&destination) {
                    destinations.push(destination);
                }
            }
            if destinations.is_empty() {
                return Err(RouteError::NoAddressFound(hostname));
            }
            Ok(destinations)
        }
    }
}

/// Resolve `hostname`, preferring the tunnel DNS servers.
pub fn resolve_hostname(hostname: &str, dns_servers: &[IpAddr]) -> Result<Vec<IpAddr>, RouteError> {
    if !dns_servers.is_empty() {
        let addrs = resolve_with_dns(hostname, dns_servers);
        if !addrs.is_empty() {
            return Ok(addrs);
        }
        warn!(
            "Tunnel DNS gave no answer for {}, falling back to system DNS",
            hostname
        );
    }
    resolve_host(hostname)
}

/// Resolve hostname using system DNS (std::net)
pub fn resolve_host(hostname: &str) -> Result<Vec<IpAddr>, RouteError> {
    debug!("Resolving {} via system DNS", hostname);
    let addrs = (hostname, 0)
        .to_socket_addrs()
        .map_err(|e| RouteError::DnsError {
            host: hostname.to_string(),
            source: e,
        })?;

    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }
    if ips.is_empty() {
        return Err(RouteError::NoAddressFound(hostname.to_string()));
    }
    info!("System DNS resolved {} -> {:?}", hostname, ips);
    Ok(ips)
}

/// Query the given DNS servers directly for A and AAAA records.
///
/// The first server that answers wins. Errors are logged and yield an empty list.
pub fn resolve_with_dns(hostname: &str, dns_servers: &[IpAddr]) -> Vec<IpAddr> {
    for dns_server in dns_servers {
        let server_addr = SocketAddr::new(*dns_server, 53);
        let mut found = Vec::new();
        for qtype in [QTYPE_A, QTYPE_AAAA] {
            let (id, query) = build_dns_query(hostname, qtype);
            match query_dns_server(&query, id, qtype, server_addr) {
                Ok(ips) => found.extend(ips),
                Err(e) => debug!("DNS query to {} failed: {}", dns_server, e),
            }
        }
        if !found.is_empty() {
            info!("Tunnel DNS resolved {} -> {:?} (via {})", hostname, found, dns_server);
            return found;
        }
    }
    Vec::new()
}

/// Build a minimal DNS query packet, returning its transaction id
fn build_dns_query(hostname: &str, qtype: u16) -> (u16, Vec<u8>) {
    let mut packet = Vec::with_capacity(512);

    // Transaction ID (random-ish)
    let id: u16 = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        & 0xFFFF) as u16;
    packet.extend_from_slice(&id.to_be_bytes());

    // Flags: standard query, recursion desired
    packet.extend_from_slice(&[0x01, 0x00]);

    // QDCOUNT = 1, ANCOUNT = NSCOUNT = ARCOUNT = 0
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in hostname.split('.').filter(|l| !l.is_empty()) {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00);

    packet.extend_from_slice(&qtype.to_be_bytes());
    // QCLASS = IN
    packet.extend_from_slice(&[0x00, 0x01]);

    (id, packet)
}

/// Send DNS query to server and parse response
fn query_dns_server(
    query: &[u8],
    id: u16,
    qtype: u16,
    server: SocketAddr,
) -> Result<Vec<IpAddr>, RouteError> {
    let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr)
        .map_err(|e| RouteError::DnsQueryFailed(format!("bind failed: {}", e)))?;
    socket
        .set_read_timeout(Some(DNS_TIMEOUT))
        .map_err(|e| RouteError::DnsQueryFailed(format!("set timeout failed: {}", e)))?;
    socket
        .send_to(query, server)
        .map_err(|e| RouteError::DnsQueryFailed(format!("send failed: {}", e)))?;

    let mut response = [0u8; 2048];
    let (len, _) = socket
        .recv_from(&mut response)
        .map_err(|e| RouteError::DnsQueryFailed(format!("recv failed: {}", e)))?;

    parse_dns_response(&response[..len], id, qtype)
}

/// Extract every A/AAAA answer of type `qtype` from a response packet
fn parse_dns_response(response: &[u8], id: u16, qtype: u16) -> Result<Vec<IpAddr>, RouteError> {
    if response.len() < 12 {
        return Err(RouteError::DnsQueryFailed("response too short".to_string()));
    }
    if u16::from_be_bytes([response[0], response[1]]) != id {
        return Err(RouteError::DnsQueryFailed("transaction id mismatch".to_string()));
    }
    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(RouteError::DnsQueryFailed(format!("DNS error code: {}", rcode)));
    }

    let qdcount = u16::from_be_bytes([response[4], response[5]]);
    let ancount = u16::from_be_bytes([response[6], response[7]]);

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(response, pos)
            .ok_or_else(|| RouteError::DnsQueryFailed("question truncated".to_string()))?;
        pos += 4; // QTYPE + QCLASS
    }

    let mut ips = Vec::new();
    for _ in 0..ancount {
        pos = match skip_name(response, pos) {
            Some(p) => p,
            None => break,
        };
        if pos + 10 > response.len() {
            break;
        }
        let atype = u16::from_be_bytes([response[pos], response[pos + 1]]);
        let aclass = u16::from_be_bytes([response[pos + 2], response[pos + 3]]);
        let rdlength = u16::from_be_bytes([response[pos + 8], response[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > response.len() {
            break;
        }
        let rdata = &response[pos..pos + rdlength];
        pos += rdlength;

        if aclass != 1 || atype != qtype {
            continue; // CNAME and friends
        }
        match (atype, rdlength) {
            (QTYPE_A, 4) => {
                ips.push(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
            }
            (QTYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                ips.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
    }
    Ok(ips)
}

/// Offset just past the (possibly compressed) name starting at `pos`
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            packet.get(pos + 1)?;
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
    }
}
