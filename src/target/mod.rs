//! Assertion targets.
//!
//! A [`Target`] is the capability set the engine needs from a machine: read,
//! write, hash and search files. The engine only ever talks to this trait,
//! so the local host, an SSH host and in-memory test doubles are
//! interchangeable.
//!
//! All operations block until they complete or fail.

pub mod auth;
pub mod local;
#[cfg(feature = "remote")]
pub mod remote;

pub use auth::{AuthMethod, AuthPrompter};
pub use local::LocalTarget;
#[cfg(feature = "remote")]
pub use remote::RemoteTarget;

use crate::config::{Machine, MachineKind};
use crate::error::{Error, Result};
use std::io::{Read, Write};
use tracing::info;

/// Write handle returned by [`Target::open_for_write`].
///
/// `finish` flushes and releases the handle, reporting anything that failed
/// on close. Dropping an unfinished sink still releases it, but close errors
/// are lost.
pub trait FileSink: Write {
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Backend-agnostic file operations on one machine
pub trait Target {
    /// Machine name from the spec
    fn name(&self) -> &str;

    /// Open `path` for reading.
    ///
    /// Must return [`Error::NotFound`] when the path does not exist and a
    /// different error for every other failure.
    fn open_for_read(&mut self, path: &str) -> Result<Box<dyn Read>>;

    /// Open `path` for writing, creating or truncating it
    fn open_for_write(&mut self, path: &str) -> Result<Box<dyn FileSink>>;

    /// MD5 digest of the file at `path`
    fn hash(&mut self, path: &str) -> Result<Vec<u8>>;

    /// True if some line of the file matches the extended regex `pattern`
    fn contains_pattern(&mut self, path: &str, pattern: &str) -> Result<bool>;

    /// Release the connection
    fn close(&mut self) -> Result<()>;
}

/// Opens a [`Target`] for a machine spec
pub trait Connector {
    fn connect(
        &mut self,
        name: &str,
        machine: &Machine,
        prompter: &mut dyn AuthPrompter,
    ) -> Result<Box<dyn Target>>;
}

/// Connects `local` machines to [`LocalTarget`] and `ssh` machines to the SSH backend
#[derive(Debug, Default, Clone, Copy)]
pub struct BackendConnector;

impl Connector for BackendConnector {
    fn connect(
        &mut self,
        name: &str,
        machine: &Machine,
        prompter: &mut dyn AuthPrompter,
    ) -> Result<Box<dyn Target>> {
        match machine.kind {
            MachineKind::Local => {
                info!("Using local host as machine {}", name);
                Ok(Box::new(LocalTarget::new(name)))
            }
            #[cfg(feature = "remote")]
            MachineKind::Ssh => Ok(Box::new(RemoteTarget::connect(name, machine, prompter)?)),
            #[cfg(not(feature = "remote"))]
            MachineKind::Ssh => {
                let _ = prompter;
                Err(Error::RemoteUnavailable(name.to_string()))
            }
        }
    }
}

/// Parse the output of `md5sum` / `md5 -q`: the digest is the first field
pub(crate) fn parse_hash_output(output: &[u8]) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(output);
    let digest = text.split_whitespace().next().unwrap_or_default();
    hex::decode(digest).map_err(|source| Error::HashParse {
        output: text.trim().to_string(),
        source,
    })
}

/// Map a `grep -q` exit status: 0 is a match, 1 is no match, anything else
/// (including death by signal) is `None`
pub(crate) fn grep_outcome(status: Option<i32>) -> Option<bool> {
    match status {
        Some(0) => Some(true),
        Some(1) => Some(false),
        _ => None,
    }
}

/// Quote `arg` for a POSIX shell. A leading `~/` stays unquoted so the
/// remote shell expands it.
#[cfg_attr(not(feature = "remote"), allow(dead_code))]
pub(crate) fn shell_quote(arg: &str) -> String {
    if let Some(rest) = arg.strip_prefix("~/") {
        return format!("~/{}", shell_quote(rest));
    }
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:,@%=".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_md5sum_output() {
        let digest = parse_hash_output(b"d41d8cd98f00b204e9800998ecf8427e  /tmp/empty\n").unwrap();
        assert_eq!(hex::encode(digest), "d41d8cd98f00b204e9800998ecf8427e");

        let digest = parse_hash_output(b"D41D8CD98F00B204E9800998ECF8427E\n").unwrap();
        assert_eq!(digest.len(), 16);
    }

    #[test]
    fn test_parse_garbage_hash_output() {
        let err = parse_hash_output(b"md5sum: /nope: No such file or directory").unwrap_err();
        assert!(matches!(err, Error::HashParse { .. }));
        assert!(parse_hash_output(b"").is_ok_and(|d| d.is_empty()));
    }

    #[test]
    fn test_grep_outcome() {
        assert_eq!(grep_outcome(Some(0)), Some(true));
        assert_eq!(grep_outcome(Some(1)), Some(false));
        assert_eq!(grep_outcome(Some(2)), None);
        assert_eq!(grep_outcome(None), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/motd"), "/etc/motd");
        assert_eq!(shell_quote("my file"), "'my file'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("a|b"), "'a|b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("~/my file"), "~/'my file'");
        assert_eq!(shell_quote("~root"), "'~root'");
    }

    #[test]
    fn test_local_machines_connect_locally() {
        struct NoPrompt;
        impl AuthPrompter for NoPrompt {
            fn password(&mut self, _prompt: &str) -> Result<String> {
                unreachable!("local machines never prompt")
            }
            fn keyboard_interactive(
                &mut self,
                _user: &str,
                _instruction: &str,
                _questions: &[String],
                _echos: &[bool],
            ) -> Result<Vec<String>> {
                unreachable!("local machines never prompt")
            }
        }

        let target = BackendConnector
            .connect("workstation", &Machine::local(), &mut NoPrompt)
            .unwrap();
        assert_eq!(target.name(), "workstation");
    }
}
