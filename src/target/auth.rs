//! SSH authentication negotiation.
//!
//! A machine's auth entries are turned into an ordered list of
//! [`AuthMethod`]s before any connection is made. Key files are read and
//! decoded here, so a missing, malformed or passphrase-protected key aborts
//! setup instead of surfacing as a rejected login.

use crate::config::{AuthKind, MachineAuth};
use crate::error::{Error, Result};
use crate::paths;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Key used by `user-key` entries
pub const DEFAULT_KEY_PATH: &str = "~/.ssh/id_rsa";

/// Prompt text for the password fallback of `prompt` entries
pub const PASSWORD_PROMPT: &str = "Password: ";

/// Supplies credentials interactively while a remote connection is set up.
///
/// Called synchronously, one challenge at a time. Answers are never cached.
pub trait AuthPrompter {
    /// Ask for a password
    fn password(&mut self, prompt: &str) -> Result<String>;

    /// Answer a keyboard-interactive challenge, one answer per question
    fn keyboard_interactive(
        &mut self,
        user: &str,
        instruction: &str,
        questions: &[String],
        echos: &[bool],
    ) -> Result<Vec<String>>;
}

/// One authentication attempt, tried in list order
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(String),
    /// Server challenges answered through [`AuthPrompter::keyboard_interactive`]
    KeyboardInteractive,
    /// Password read through [`AuthPrompter::password`]
    PasswordPrompt,
    /// Decoded key file; `pem` holds the armoured text handed to libssh2
    PrivateKey { path: PathBuf, pem: String },
}

impl AuthMethod {
    /// Method name as advertised by SSH servers
    pub fn protocol_name(&self) -> &'static str {
        match self {
            Self::Password(_) | Self::PasswordPrompt => "password",
            Self::KeyboardInteractive => "keyboard-interactive",
            Self::PrivateKey { .. } => "publickey",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyboardInteractive => f.write_str("KeyboardInteractive"),
            Self::PasswordPrompt => f.write_str("PasswordPrompt"),
            Self::PrivateKey { path, .. } => write!(f, "PrivateKey({})", path.display()),
        }
    }
}

/// Build the ordered method list for a machine's auth entries
pub fn build_methods(entries: &[MachineAuth]) -> Result<Vec<AuthMethod>> {
    let mut methods = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.effective_kind() {
            Some(AuthKind::Password) => methods.push(AuthMethod::Password(entry.password.clone())),
            Some(AuthKind::Prompt) => {
                methods.push(AuthMethod::KeyboardInteractive);
                methods.push(AuthMethod::PasswordPrompt);
            }
            Some(AuthKind::UserKey) => methods.push(load_private_key(DEFAULT_KEY_PATH)?),
            Some(AuthKind::KeyFile) => methods.push(load_private_key(&entry.key)?),
            None => warn!("Skipping auth entry without a kind"),
        }
    }
    Ok(methods)
}

fn load_private_key(path: &str) -> Result<AuthMethod> {
    let expanded = paths::expand(path);
    let contents =
        fs::read_to_string(&expanded).map_err(|e| Error::key_file(path, e.to_string()))?;
    decode_private_key(&contents).map_err(|reason| Error::key_file(path, reason))?;
    Ok(AuthMethod::PrivateKey {
        path: expanded,
        pem: contents,
    })
}

/// Decode a private key so a bad file is caught before dialing.
///
/// OpenSSH keys go through `ssh-key`; PKCS#1, SEC1 and PKCS#8 keys must
/// carry a well-formed DER body. Encrypted keys are refused since there is
/// no passphrase to unlock them with.
fn decode_private_key(contents: &str) -> std::result::Result<(), String> {
    let label = pem_label(contents).ok_or("not a PEM or OpenSSH private key")?;
    if label == "OPENSSH PRIVATE KEY" {
        let key = ssh_key::PrivateKey::from_openssh(contents.trim())
            .map_err(|e| format!("invalid OpenSSH private key: {e}"))?;
        if key.is_encrypted() {
            return Err("passphrase-protected keys are not supported".to_string());
        }
        return Ok(());
    }
    if label == "ENCRYPTED PRIVATE KEY" || contents.contains("Proc-Type: 4,ENCRYPTED") {
        return Err("passphrase-protected keys are not supported".to_string());
    }
    der::Document::from_pem(contents.trim())
        .map_err(|e| format!("invalid {label}: {e}"))?;
    Ok(())
}

/// Label of a PEM-armoured private key (`-----BEGIN <label>-----`)
fn pem_label(contents: &str) -> Option<&str> {
    let mut lines = contents.lines().map(str::trim);
    let begin = lines.find(|line| line.starts_with("-----BEGIN "))?;
    let label = begin
        .strip_prefix("-----BEGIN ")
        .and_then(|rest| rest.strip_suffix("-----"))?;
    let closed = lines.any(|line| line == format!("-----END {label}-----"));
    (label.ends_with("PRIVATE KEY") && closed).then_some(label)
}
