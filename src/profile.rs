//! Connection profiles and the tunnel command line derived from them

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Name of the tunnel binary looked up on `PATH` when no explicit path is configured.
pub const TUNNEL_BINARY: &str = "openfortivpn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Password,
    Saml,
}

/// A named VPN endpoint. Treated as immutable input for one connection attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saml_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Raw user entries: IP, CIDR, hostname or URL
    #[serde(default)]
    pub route_targets: Vec<String>,
    /// Browser key used for SAML redirects (`firefox`, `chrome`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_profile: Option<String>,
    /// Route through this interface instead of the one the tunnel announces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

fn default_port() -> u16 {
    443
}

impl ConnectionProfile {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            auth_mode: AuthMode::Password,
            saml_port: None,
            username: None,
            auto_reconnect: false,
            route_targets: Vec::new(),
            browser: None,
            browser_profile: None,
            interface: None,
        }
    }

    pub fn is_saml(&self) -> bool {
        self.auth_mode == AuthMode::Saml
    }

    /// Host and port with any `host:port` suffix in `host` taking precedence.
    pub fn host_port(&self) -> (String, u16) {
        if let Some((host, port)) = self.host.rsplit_once(':') {
            if !host.is_empty() && !host.contains(':') {
                if let Ok(port) = port.parse() {
                    return (host.to_string(), port);
                }
            }
        }
        (self.host.clone(), self.port)
    }

    /// Arguments passed to the tunnel binary (without the binary itself).
    pub fn tunnel_args(&self) -> Vec<String> {
        let (host, port) = self.host_port();
        let mut args = vec![format!("{}:{}", host, port)];
        match self.auth_mode {
            AuthMode::Saml => match self.saml_port {
                Some(port) => args.push(format!("--saml-login={}", port)),
                None => args.push("--saml-login".to_string()),
            },
            AuthMode::Password => {
                if let Some(user) = self.username.as_deref().filter(|u| !u.is_empty()) {
                    args.push(format!("--username={}", user));
                }
            }
        }
        args
    }

    /// Full launch command: `[binary, host:port, auth flag]`
    pub fn launch_command(&self, binary: &str) -> Vec<String> {
        let mut command = vec![binary.to_string()];
        command.extend(self.tunnel_args());
        command
    }

    /// Tokens identifying this profile's tunnel process in a foreign command line.
    ///
    /// Extra signatures (previous launch command lines) contribute their
    /// arguments, so processes started with an older host spelling still match.
    pub fn signature_tokens(&self, signatures: &[Vec<String>]) -> Vec<String> {
        let (host, port) = self.host_port();
        let mut tokens = BTreeSet::new();
        tokens.insert(format!("{}:{}", host, port));
        tokens.insert(format!("{} {}", host, port));
        if self.host != host {
            tokens.insert(self.host.clone());
        }
        for signature in signatures {
            // skip the binary path, it is shared by every profile
            for part in signature.iter().skip(1) {
                if part.contains(':') && !part.starts_with("--") {
                    tokens.insert(part.clone());
                }
            }
        }
        tokens.into_iter().filter(|t| !t.is_empty()).collect()
    }

    /// Whether a foreign command line belongs to this profile.
    pub fn matches_command_line(&self, cmdline: &str, signatures: &[Vec<String>]) -> bool {
        let tokens = self.signature_tokens(signatures);
        let host_match = tokens.iter().any(|token| {
            cmdline
                .split_whitespace()
                .any(|arg| arg == token)
                || (token.contains(' ') && cmdline.contains(token.as_str()))
        });
        if !host_match {
            return false;
        }
        match (self.auth_mode, self.saml_port) {
            (AuthMode::Saml, Some(port)) => cmdline.contains(&format!("--saml-login={}", port)),
            (AuthMode::Saml, None) => cmdline.contains("--saml-login"),
            (AuthMode::Password, _) => !cmdline.contains("--saml-login"),
        }
    }
}
