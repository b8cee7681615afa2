//! fortivpn-manager - supervisor for openfortivpn tunnels
//!
//! Runs one `openfortivpn` process per connection profile under pkexec or
//! sudo, follows its output to track the connection, forces configured
//! destinations through the tunnel interface and restores the previous
//! routes when the tunnel goes away.
//!
//! # Architecture
//!
//! - `privilege`: Elevation helper/credential tool selection and signal delivery
//! - `routing`: Route target resolution and per-session route reconciliation
//! - `supervisor`: Tunnel process lifecycle, output classification, reconnect
//! - `registry`: Active connections by profile name and orphan cleanup
//! - `config`: Configuration file handling (TOML)
//! - `credentials`: Keyring storage and terminal prompts
//! - `browser`: SAML login URL handling
//!
//! # Usage
//!
//! ```bash
//! fortivpn-manager init
//! fortivpn-manager connect work
//! ```

pub mod browser;
pub mod config;
pub mod credentials;
pub mod privilege;
pub mod profile;
pub mod registry;
pub mod routing;
pub mod supervisor;

pub use config::Config;
pub use profile::{AuthMode, ConnectionProfile};
pub use registry::ConnectionRegistry;
pub use supervisor::{ConnectionState, SessionEvent};
