//! Machine specs: which hosts to assert against and how to reach them.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use strum::{Display, EnumString};

use super::{Format, read_document};

/// How a machine is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MachineKind {
    /// The host machassert is running on
    #[default]
    Local,
    /// A host reached over SSH
    Ssh,
}

/// Credential source for an SSH machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AuthKind {
    /// Fixed password from the machine file
    Password,
    /// Ask interactively (keyboard-interactive, then password)
    Prompt,
    /// The user's default private key, `~/.ssh/id_rsa`
    UserKey,
    /// An explicit private key file
    KeyFile,
}

/// How the server's host key is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Key must match an entry in `~/.ssh/known_hosts`
    #[default]
    KnownHosts,
    /// Accept whatever key the server presents
    AcceptAny,
}

/// One authentication entry of a machine
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AuthKind>,
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Private key path for `key-file`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

impl MachineAuth {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            kind: Some(AuthKind::Password),
            password: password.into(),
            key: String::new(),
        }
    }

    pub fn prompt() -> Self {
        Self {
            kind: Some(AuthKind::Prompt),
            ..Self::default()
        }
    }

    pub fn user_key() -> Self {
        Self {
            kind: Some(AuthKind::UserKey),
            ..Self::default()
        }
    }

    pub fn key_file(key: impl Into<String>) -> Self {
        Self {
            kind: Some(AuthKind::KeyFile),
            key: key.into(),
            ..Self::default()
        }
    }

    /// Explicit kind, or `password` when only a password was given
    pub fn effective_kind(&self) -> Option<AuthKind> {
        self.kind
            .or_else(|| (!self.password.is_empty()).then_some(AuthKind::Password))
    }

    fn validate(&self) -> Result<()> {
        match self.effective_kind() {
            None => bail!("auth kind must be specified"),
            Some(AuthKind::Password) if self.password.is_empty() => {
                bail!("Password must be specified for password authentication")
            }
            Some(AuthKind::KeyFile) if self.key.trim().is_empty() => {
                bail!("key must be specified for key-file authentication")
            }
            Some(_) => Ok(()),
        }
    }
}

/// A single assertion target
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Machine {
    #[serde(default)]
    pub kind: MachineKind,
    /// `host` or `host:port` (remote only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "super::one_or_many"
    )]
    pub auth: Vec<MachineAuth>,
    #[serde(default)]
    pub host_key: HostKeyPolicy,
    /// Bound on connect and every blocking session call (remote only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Machine {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn ssh(destination: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            kind: MachineKind::Ssh,
            destination: destination.into(),
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn with_auth(mut self, auth: MachineAuth) -> Self {
        self.auth.push(auth);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    fn normalize(&mut self) {
        for auth in &mut self.auth {
            if auth.kind.is_none() {
                auth.kind = auth.effective_kind();
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.kind == MachineKind::Local {
            return Ok(());
        }
        if self.destination.trim().is_empty() {
            bail!("destination must be specified for ssh machines");
        }
        if self.username.trim().is_empty() {
            bail!("username must be specified for ssh machines");
        }
        for (index, auth) in self.auth.iter().enumerate() {
            auth.validate().with_context(|| format!("auth entry {}", index + 1))?;
        }
        Ok(())
    }
}

/// A named set of machines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    #[serde(default, rename = "machine")]
    pub machines: BTreeMap<String, Machine>,
}

impl MachineSpec {
    /// The host machassert is running on, used when no targets file is given
    pub fn local_default() -> Self {
        Self {
            name: "local".to_string(),
            machines: BTreeMap::from([("local".to_string(), Machine::local())]),
        }
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            machines: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, machine: Machine) -> Self {
        self.machines.insert(name.into(), machine);
        self
    }

    /// Load, normalize and validate a targets file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let spec: Self = read_document(path)?;
        spec.prepared()
            .with_context(|| format!("Invalid targets in {}", path.display()))
    }

    /// Parse, normalize and validate targets from a string
    pub fn parse(content: &str, format: Format) -> Result<Self> {
        format.parse::<Self>(content)?.prepared()
    }

    fn prepared(mut self) -> Result<Self> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Set the auth kind of entries that only carry a password
    pub fn normalize(&mut self) {
        self.machines.values_mut().for_each(Machine::normalize);
    }

    /// Check remote machines are reachable with usable credentials
    pub fn validate(&self) -> Result<()> {
        for (name, machine) in &self.machines {
            machine
                .validate()
                .with_context(|| format!("machine {name:?}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_default() {
        let spec = MachineSpec::local_default();
        assert_eq!(spec.machines.len(), 1);
        assert_eq!(spec.machines["local"].kind, MachineKind::Local);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_password_implies_auth_kind() {
        let mut spec = MachineSpec::new("frontend").with(
            "frontend-1",
            Machine::ssh("10.5.32.1", "deploy").with_auth(MachineAuth {
                password: "1234".to_string(),
                ..MachineAuth::default()
            }),
        );
        spec.normalize();
        assert_eq!(
            spec.machines["frontend-1"].auth[0].kind,
            Some(AuthKind::Password)
        );
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_unusable_credentials_rejected() {
        let spec = MachineSpec::new("t").with(
            "m",
            Machine::ssh("host", "user").with_auth(MachineAuth {
                kind: Some(AuthKind::Password),
                ..MachineAuth::default()
            }),
        );
        assert!(spec.validate().is_err());

        let spec = MachineSpec::new("t")
            .with("m", Machine::ssh("host", "user").with_auth(MachineAuth::key_file("")));
        assert!(spec.validate().is_err());

        let spec = MachineSpec::new("t")
            .with("m", Machine::ssh("host", "user").with_auth(MachineAuth::default()));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_ssh_requires_destination_and_username() {
        let spec = MachineSpec::new("t").with("m", Machine::ssh("", "user"));
        assert!(spec.validate().is_err());
        let spec = MachineSpec::new("t").with("m", Machine::ssh("host", ""));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(AuthKind::UserKey.to_string(), "user-key");
        assert_eq!("key-file".parse::<AuthKind>().unwrap(), AuthKind::KeyFile);
        assert_eq!(HostKeyPolicy::AcceptAny.to_string(), "accept-any");
        assert_eq!("ssh".parse::<MachineKind>().unwrap(), MachineKind::Ssh);
    }
}
