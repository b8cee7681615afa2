//! Opening SAML login URLs in a browser

use crate::privilege::find_in_path;
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, error, info};

/// Fallback handler when no browser is configured or the configured one fails
const SYSTEM_OPENER: &str = "xdg-open";

/// Known browser keys and the executables that provide them
const BROWSERS: [(&str, &[&str]); 4] = [
    ("firefox", &["firefox"]),
    ("chromium", &["chromium", "chromium-browser"]),
    ("chrome", &["google-chrome", "google-chrome-stable"]),
    ("edge", &["microsoft-edge"]),
];

pub trait BrowserLauncher: Send + Sync {
    /// Open `url`, best effort. `browser` is a key such as `firefox`; `None`
    /// or `system` means the desktop default.
    fn open_url(&self, browser: Option<&str>, profile: Option<&str>, url: &str) -> bool;
}

/// Launches installed browsers found on `PATH`
#[derive(Debug, Default)]
pub struct SystemBrowser;

impl SystemBrowser {
    fn executable(key: &str) -> Option<String> {
        let (_, candidates) = BROWSERS.iter().find(|(k, _)| *k == key)?;
        candidates
            .iter()
            .find_map(|name| find_in_path(name))
            .map(|path| path.to_string_lossy().into_owned())
    }

    fn spawn(args: &[String]) -> bool {
        launch_detached(args).is_some()
    }

    fn open_default(url: &str) -> bool {
        Self::spawn(&[SYSTEM_OPENER.to_string(), url.to_string()])
    }
}

impl BrowserLauncher for SystemBrowser {
    fn open_url(&self, browser: Option<&str>, profile: Option<&str>, url: &str) -> bool {
        info!("Opening browser for SAML login: {}", url);
        let key = match browser {
            Some(key) if key != "system" => key,
            _ => return Self::open_default(url),
        };
        match Self::executable(key) {
            Some(executable) => {
                let args = browser_command(key, &executable, profile, url);
                Self::spawn(&args) || Self::open_default(url)
            }
            None => {
                debug!("Browser {} is not installed, using {}", key, SYSTEM_OPENER);
                Self::open_default(url)
            }
        }
    }
}

/// Start `args` in the background. The child is waited for on its own
/// thread so it never lingers as a zombie. Returns its pid and the reaper.
fn launch_detached(args: &[String]) -> Option<(u32, thread::JoinHandle<()>)> {
    let (program, rest) = args.split_first()?;
    debug!("Launching browser: {}", args.join(" "));
    let mut child = match Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("Failed to open browser {}: {}", program, e);
            return None;
        }
    };
    let pid = child.id();
    let reaper = thread::spawn(move || match child.wait() {
        Ok(status) => debug!("Browser process {} exited with {}", pid, status),
        Err(e) => debug!("Could not wait for browser process {}: {}", pid, e),
    });
    Some((pid, reaper))
}

/// Command line opening `url` in `executable` with an optional profile.
pub fn browser_command(key: &str, executable: &str, profile: Option<&str>, url: &str) -> Vec<String> {
    let mut args = vec![executable.to_string()];
    if let Some(profile) = profile.filter(|p| !p.is_empty()) {
        if key == "firefox" {
            args.extend(["-P".to_string(), profile.to_string()]);
        } else {
            args.push(format!("--profile-directory={}", profile));
        }
    }
    args.push(url.to_string());
    args
}
