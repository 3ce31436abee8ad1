//! Error handling for the assertion engine
//!
//! Every backend, evaluator and dispatcher operation returns these types.
//! The engine never swallows one: the first error encountered ends the run.

use thiserror::Error;

/// Main error type for machassert
#[derive(Error, Debug)]
pub enum Error {
    /// The path does not exist on the target.
    ///
    /// Kept distinct from every other failure: `exists` / `!exists`
    /// assertions are decided on it.
    #[error("{path}: no such file or directory")]
    NotFound { path: String },

    /// IO errors (local files, pipes, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A local subprocess exited unsuccessfully
    #[error("command `{command}` failed (exit status {}): {stderr}", display_status(.status))]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// A command run over the remote session exited unsuccessfully
    #[error("remote command `{command}` failed (exit status {status}): {stderr}")]
    RemoteCommand {
        command: String,
        status: i32,
        stderr: String,
    },

    /// SSH transport / session errors
    #[cfg(feature = "remote")]
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// Hash utility output could not be decoded
    #[error("could not parse hash output {output:?}: {source}")]
    HashParse {
        output: String,
        #[source]
        source: hex::FromHexError,
    },

    /// Hashing is not implemented for this host OS
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Private key file could not be read or parsed
    #[error("key file {path}: {reason}")]
    KeyFile { path: String, reason: String },

    /// No configured authentication method was accepted
    #[error("authentication failed for {username}@{destination}")]
    AuthenticationFailed {
        username: String,
        destination: String,
    },

    /// Host key could not be verified against the configured policy
    #[error("host key verification failed for {destination}: {reason}")]
    HostKey { destination: String, reason: String },

    /// Remote machine requested from a build without SSH support
    #[error("machine {0} is remote, but this build has no SSH support (enable the `remote` feature)")]
    RemoteUnavailable(String),

    /// Sentinel returned by the FAIL action
    #[error("assertions failed")]
    AssertionsFailed,

    /// Malformed assertion file: assertion kind not known to the evaluator
    #[error("unknown assertion kind: {0}")]
    UnknownAssertionKind(String),

    /// Malformed assertion file: action kind not known to the dispatcher
    #[error("unrecognised action kind: {0}")]
    UnrecognisedActionKind(String),

    /// ASSERT actions nested deeper than the engine allows
    #[error("nested assertions exceed the maximum depth of {0}")]
    NestingTooDeep(usize),
}

/// Result type alias for engine and backend operations
pub type Result<T> = std::result::Result<T, Error>;

fn display_status(status: &Option<i32>) -> String {
    status.map_or_else(|| "signal".to_string(), |code| code.to_string())
}

impl Error {
    /// Create a not-found error for `path`
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a key file error
    pub fn key_file(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::KeyFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True if this is the "path does not exist" condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True if this is the sentinel produced by a FAIL action
    pub fn is_assertion_failure(&self) -> bool {
        matches!(self, Self::AssertionsFailed)
    }

    /// Map an IO error for `path`, turning `ErrorKind::NotFound` into [`Error::NotFound`]
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(path)
        } else {
            Self::Io(err)
        }
    }
}
