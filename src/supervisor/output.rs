//! Classification of tunnel process output
//!
//! Each line is run through a fixed list of predicates; every predicate that
//! matches yields one typed event. The supervisor acts on the events, so the
//! connection state machine never looks at raw text.

use crate::profile::AuthMode;
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;

static INTERFACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(ppp\d+|tun\d+|tap\d+)\b").expect("interface regex"));
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"']+"#).expect("url regex"));

const TUNNEL_UP_MARKERS: [&str; 4] = [
    "Tunnel is up",
    "Connected to VPN",
    "SSL tunnel connected",
    "Established",
];
const AUTH_URL_MARKERS: [&str; 2] = ["Authenticate at", "open the following URL"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A tunnel device name was mentioned
    InterfaceAnnounced(String),
    /// The tunnel advertised a DNS server
    DnsServer(IpAddr),
    TunnelEstablished,
    /// SAML login URL to open in a browser
    AuthUrl(String),
    /// The binary asks for the VPN account password
    PasswordPrompt,
    /// A password was rejected
    AuthFailure,
    /// pkexec could not find a polkit agent to ask for consent
    MissingAuthAgent,
}

/// Classify one line (or an unterminated prompt fragment).
pub fn classify(line: &str, auth_mode: AuthMode) -> Vec<OutputEvent> {
    let line = line.trim();
    let mut events = Vec::new();
    if line.is_empty() {
        return events;
    }
    let lower = line.to_lowercase();

    if lower.contains("interface")
        && let Some(m) = INTERFACE_RE.captures(line).and_then(|c| c.get(1))
    {
        events.push(OutputEvent::InterfaceAnnounced(m.as_str().to_lowercase()));
    }

    if let Some(ip) = dns_server(&lower) {
        events.push(OutputEvent::DnsServer(ip));
    }

    if TUNNEL_UP_MARKERS.iter().any(|m| line.contains(m)) {
        events.push(OutputEvent::TunnelEstablished);
    }

    match auth_mode {
        AuthMode::Saml => {
            if AUTH_URL_MARKERS.iter().any(|m| line.contains(m))
                && let Some(url) = URL_RE.find(line)
            {
                let url = url.as_str().trim_end_matches(['\'', '"', ')', '.']);
                events.push(OutputEvent::AuthUrl(url.to_string()));
            }
        }
        AuthMode::Password => {
            if is_password_prompt(&lower) {
                events.push(OutputEvent::PasswordPrompt);
            }
        }
    }

    if line.contains("Sorry, try again") {
        events.push(OutputEvent::AuthFailure);
    }
    if lower.contains("no authentication agent found") {
        events.push(OutputEvent::MissingAuthAgent);
    }
    events
}

/// First address following a `dns server` mention
fn dns_server(lower: &str) -> Option<IpAddr> {
    let (_, rest) = lower.split_once("dns server")?;
    rest.split_whitespace()
        .map(|token| token.trim_matches(|c: char| matches!(c, ',' | ';' | '[' | ']' | '(' | ')')))
        .map(|token| token.trim_end_matches(['.', ':']))
        .find_map(|token| token.parse().ok())
}

/// `VPN account password:` style prompt, but not sudo's own prompt.
fn is_password_prompt(lower: &str) -> bool {
    !lower.starts_with("[sudo]")
        && lower.contains("vpn")
        && lower.contains("password")
        && lower.trim_end().ends_with(':')
}

/// Splits a byte stream on `\r` and `\n`, keeping the unterminated tail.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    /// Append `chunk` and return the complete, non-empty lines it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.flush_into(&mut lines);
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// The unterminated tail, if it is a password prompt waiting for input.
    ///
    /// Prompts are printed without a newline, so they never show up as lines.
    pub fn take_prompt(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.partial).trim().to_string();
        if is_password_prompt(&text.to_lowercase()) {
            self.partial.clear();
            return Some(text);
        }
        None
    }

    /// Whatever is left when the stream ends
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if self.partial.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.partial).trim().to_string();
        self.partial.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password(line: &str) -> Vec<OutputEvent> {
        classify(line, AuthMode::Password)
    }

    fn saml(line: &str) -> Vec<OutputEvent> {
        classify(line, AuthMode::Saml)
    }

    #[test]
    fn test_interface_announcement() {
        assert_eq!(
            password("INFO:   Interface ppp0 is UP."),
            vec![OutputEvent::InterfaceAnnounced("ppp0".to_string())]
        );
        assert_eq!(
            password("INFO:   Got addresses: [10.212.134.200], ns [10.0.0.53]"),
            vec![]
        );
        // a device name without the keyword is not an announcement
        assert_eq!(password("DEBUG:  pppd: using ppp1"), vec![]);
    }

    #[test]
    fn test_dns_server_lines() {
        assert_eq!(
            password("DEBUG:  dns server found: 10.0.0.53"),
            vec![OutputEvent::DnsServer("10.0.0.53".parse().unwrap())]
        );
        assert_eq!(
            password("INFO:   Adding VPN DNS server 2001:db8::53"),
            vec![OutputEvent::DnsServer("2001:db8::53".parse().unwrap())]
        );
        assert_eq!(password("DEBUG:  dns server found: none"), vec![]);
    }

    #[test]
    fn test_tunnel_established() {
        assert_eq!(
            password("INFO:   Tunnel is up and running."),
            vec![OutputEvent::TunnelEstablished]
        );
        assert_eq!(
            saml("INFO:   SSL tunnel connected."),
            vec![OutputEvent::TunnelEstablished]
        );
        assert_eq!(
            password("INFO:   Established SSL VPN tunnel."),
            vec![OutputEvent::TunnelEstablished]
        );
    }

    #[test]
    fn test_saml_url_only_in_saml_mode() {
        let line = "Authenticate at 'https://vpn.example.com:443/remote/saml/start?redirect=1'";
        assert_eq!(
            saml(line),
            vec![OutputEvent::AuthUrl(
                "https://vpn.example.com:443/remote/saml/start?redirect=1".to_string()
            )]
        );
        assert_eq!(password(line), vec![]);
    }

    #[test]
    fn test_password_prompt() {
        assert_eq!(
            password("VPN account password:"),
            vec![OutputEvent::PasswordPrompt]
        );
        assert_eq!(saml("VPN account password:"), vec![]);
        assert_eq!(password("[sudo] password for alice:"), vec![]);
        assert_eq!(password("Reading VPN password from config"), vec![]);
    }

    #[test]
    fn test_auth_failure() {
        assert_eq!(password("Sorry, try again."), vec![OutputEvent::AuthFailure]);
    }

    #[test]
    fn test_missing_auth_agent() {
        assert_eq!(
            saml("Error executing command as another user: No authentication agent found."),
            vec![OutputEvent::MissingAuthAgent]
        );
    }

    #[test]
    fn test_noise_yields_nothing() {
        assert!(password("").is_empty());
        assert!(password("   ").is_empty());
        assert!(password("DEBUG:  Gateway certificate validation succeeded.").is_empty());
    }

    #[test]
    fn test_line_buffer_splits_and_keeps_prompt() {
        let mut buffer = LineBuffer::default();
        assert_eq!(
            buffer.push(b"INFO:   Connected to gateway.\r\nVPN account pass"),
            vec!["INFO:   Connected to gateway."]
        );
        assert_eq!(buffer.take_prompt(), None);
        assert!(buffer.push(b"word: ").is_empty());
        assert_eq!(buffer.take_prompt().as_deref(), Some("VPN account password:"));
        assert_eq!(buffer.finish(), None);

        buffer.push(b"trailing");
        assert_eq!(buffer.finish().as_deref(), Some("trailing"));
    }
}
