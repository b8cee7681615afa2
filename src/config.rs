//! Configuration handling for fortivpn-manager

use crate::privilege::{ElevationPreference, DEFAULT_COMMAND_TIMEOUT};
use crate::profile::{ConnectionProfile, TUNNEL_BINARY};
use crate::routing::RouteSettings;
use crate::supervisor::{StopTimeouts, SupervisorSettings};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "fortivpn-manager";
const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Could not determine the user config directory")]
    NoConfigDir,
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),
    #[error("Profile {0} is defined more than once")]
    DuplicateProfile(String),
}

/// Tunables shared by every connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Tunnel binary name or absolute path
    pub binary: String,
    pub elevation: ElevationPreference,
    pub reconnect_base_secs: u64,
    pub reconnect_cap_secs: u64,
    pub stop_grace_secs: u64,
    pub kill_grace_secs: u64,
    /// Timeout of elevated route and kill commands
    pub command_timeout_secs: u64,
    pub detect_attempts: u32,
    pub detect_interval_ms: u64,
    pub appear_attempts: u32,
    pub appear_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let stop = StopTimeouts::default();
        let routes = RouteSettings::default();
        Self {
            binary: TUNNEL_BINARY.to_string(),
            elevation: ElevationPreference::Auto,
            reconnect_base_secs: 5,
            reconnect_cap_secs: 60,
            stop_grace_secs: stop.term_grace.as_secs(),
            kill_grace_secs: stop.kill_grace.as_secs(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            detect_attempts: routes.detect_attempts,
            detect_interval_ms: routes.detect_interval.as_millis() as u64,
            appear_attempts: routes.appear_attempts,
            appear_interval_ms: routes.appear_interval.as_millis() as u64,
        }
    }
}

impl Settings {
    pub fn supervisor(&self) -> SupervisorSettings {
        SupervisorSettings {
            binary: self.binary.clone(),
            reconnect_base: Duration::from_secs(self.reconnect_base_secs),
            reconnect_cap: Duration::from_secs(self.reconnect_cap_secs),
            stop: StopTimeouts {
                term_grace: Duration::from_secs(self.stop_grace_secs),
                kill_grace: Duration::from_secs(self.kill_grace_secs),
            },
        }
    }

    pub fn routes(&self) -> RouteSettings {
        RouteSettings {
            detect_attempts: self.detect_attempts,
            detect_interval: Duration::from_millis(self.detect_interval_ms),
            appear_attempts: self.appear_attempts,
            appear_interval: Duration::from_millis(self.appear_interval_ms),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub settings: Settings,
    pub profiles: Vec<ConnectionProfile>,
}

impl Config {
    /// `$XDG_CONFIG_HOME/fortivpn-manager/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;

        let mut seen = HashSet::new();
        for profile in &config.profiles {
            if !seen.insert(profile.name.as_str()) {
                return Err(ConfigError::DuplicateProfile(profile.name.clone()));
            }
        }
        Ok(config)
    }

    /// Load `path`, or the defaults if it does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn load_profile(&self, name: &str) -> Result<&ConnectionProfile, ConfigError> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    /// Insert `profile`, replacing any profile with the same name.
    pub fn save_profile(&mut self, profile: ConnectionProfile) {
        match self.profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    pub fn list_profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    /// Config written by `init`: defaults plus one example profile
    pub fn example() -> Self {
        let mut profile = ConnectionProfile::new("work", "vpn.example.com", 443);
        profile.route_targets = vec!["10.0.0.0/8".to_string()];
        Self {
            settings: Settings::default(),
            profiles: vec![profile],
        }
    }
}
