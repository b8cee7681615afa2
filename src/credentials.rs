//! Tunnel passwords in the OS keyring and interactive prompts

use crate::privilege::ElevationPrompt;
use std::io::{self, BufRead, Write};
use thiserror::Error;
use tracing::{debug, warn};

/// Keyring service name; the account is the profile name.
pub const KEYRING_SERVICE: &str = "fortivpn-manager";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("Failed to read password: {0}")]
    Prompt(#[from] io::Error),
}

/// Stored tunnel passwords, one per profile
pub trait CredentialStore: Send + Sync {
    fn load(&self, profile: &str) -> Result<Option<String>, CredentialError>;
    fn store(&self, profile: &str, password: &str) -> Result<(), CredentialError>;
    /// Returns whether something was deleted.
    fn delete(&self, profile: &str) -> Result<bool, CredentialError>;
}

/// Secret Service / Keychain backed store
#[derive(Debug, Default)]
pub struct KeyringStore;

impl KeyringStore {
    fn entry(profile: &str) -> Result<keyring::Entry, CredentialError> {
        Ok(keyring::Entry::new(KEYRING_SERVICE, profile)?)
    }
}

impl CredentialStore for KeyringStore {
    fn load(&self, profile: &str) -> Result<Option<String>, CredentialError> {
        match Self::entry(profile)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, profile: &str, password: &str) -> Result<(), CredentialError> {
        Self::entry(profile)?.set_password(password)?;
        debug!("[{}] Password stored in keyring", profile);
        Ok(())
    }

    fn delete(&self, profile: &str) -> Result<bool, CredentialError> {
        match Self::entry(profile)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Password for `profile`: the stored one, or asked on the terminal.
///
/// A prompted password is written back to `store` when the user agrees.
pub fn resolve_password(
    store: &dyn CredentialStore,
    profile: &str,
    username: Option<&str>,
) -> Result<String, CredentialError> {
    match store.load(profile) {
        Ok(Some(password)) => {
            debug!("[{}] Using stored password", profile);
            return Ok(password);
        }
        Ok(None) => {}
        Err(e) => warn!("[{}] Could not read keyring: {}", profile, e),
    }

    let prompt = match username {
        Some(user) => format!("VPN password for {}@{}: ", user, profile),
        None => format!("VPN password for {}: ", profile),
    };
    let password = rpassword::prompt_password(prompt)?;
    if ask_yes_no("Save password to keyring? [y/N] ")? {
        if let Err(e) = store.store(profile, &password) {
            warn!("[{}] Could not save password: {}", profile, e);
        }
    }
    Ok(password)
}

fn ask_yes_no(question: &str) -> io::Result<bool> {
    eprint!("{}", question);
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(parse_yes(&answer))
}

fn parse_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Asks for the sudo password on the controlling terminal
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl ElevationPrompt for TerminalPrompt {
    fn request_secret(&self, prompt: &str) -> Option<(String, bool)> {
        eprintln!("{}", prompt);
        let secret = match rpassword::prompt_password("Password: ") {
            Ok(secret) if !secret.is_empty() => secret,
            Ok(_) => return None,
            Err(e) => {
                warn!("Could not read elevation password: {}", e);
                return None;
            }
        };
        let reuse = ask_yes_no("Remember for this session? [y/N] ").unwrap_or(false);
        Some((secret, reuse))
    }
}
