//! The host machassert runs on.
//!
//! Reads and writes go straight to the filesystem. Hashing and pattern search
//! shell out to the platform's `md5sum`/`md5` and `grep`, so results match
//! what the SSH backend computes on remote hosts.

use super::{FileSink, Target, grep_outcome, parse_hash_output};
use crate::error::{Error, Result};
use crate::paths;
use std::ffi::OsStr;
use std::fs::File;
use std::io::Read;
use std::process::{Command, Output};
use tracing::debug;

/// Local host as an assertion target
#[derive(Debug, Clone)]
pub struct LocalTarget {
    name: String,
}

impl LocalTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Run `program` to completion, capturing its output.
    ///
    /// Only a spawn failure is an error here; callers interpret the exit status.
    fn run(&self, program: &str, args: &[&OsStr]) -> Result<Output> {
        debug!("{}: running {} {:?}", self.name, program, args);
        let output = Command::new(program).args(args).output()?;
        debug!("{}: {} exited with {}", self.name, program, output.status);
        Ok(output)
    }
}

/// Hash utility and its fixed arguments for the current OS
fn md5_command() -> Result<(&'static str, Vec<&'static str>)> {
    match std::env::consts::OS {
        "linux" => Ok(("md5sum", vec![])),
        "macos" => Ok(("md5", vec!["-q"])),
        other => Err(Error::UnsupportedPlatform(other.to_string())),
    }
}

/// Arguments for the hash utility. `--` ends option parsing so a path
/// starting with `-` is never read as a flag.
fn hash_args<'a>(flags: &[&'a str], path: &'a OsStr) -> Vec<&'a OsStr> {
    let mut args: Vec<&OsStr> = flags.iter().map(|f| OsStr::new(*f)).collect();
    args.push(OsStr::new("--"));
    args.push(path);
    args
}

fn grep_args<'a>(pattern: &'a str, path: &'a OsStr) -> [&'a OsStr; 6] {
    [
        OsStr::new("-q"),
        OsStr::new("-E"),
        OsStr::new("-e"),
        OsStr::new(pattern),
        OsStr::new("--"),
        path,
    ]
}

fn command_error(program: &str, path: &str, output: &Output) -> Error {
    Error::Command {
        command: format!("{program} {path}"),
        status: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

impl Target for LocalTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_for_read(&mut self, path: &str) -> Result<Box<dyn Read>> {
        let file = File::open(paths::expand(path)).map_err(|e| Error::from_io(e, path))?;
        Ok(Box::new(file))
    }

    fn open_for_write(&mut self, path: &str) -> Result<Box<dyn FileSink>> {
        let file = File::create(paths::expand(path)).map_err(|e| Error::from_io(e, path))?;
        Ok(Box::new(file))
    }

    fn hash(&mut self, path: &str) -> Result<Vec<u8>> {
        let (program, flags) = md5_command()?;
        let expanded = paths::expand(path);
        let output = self.run(program, &hash_args(&flags, expanded.as_os_str()))?;
        if !output.status.success() {
            return Err(command_error(program, path, &output));
        }
        parse_hash_output(&output.stdout)
    }

    fn contains_pattern(&mut self, path: &str, pattern: &str) -> Result<bool> {
        let expanded = paths::expand(path);
        let output = self.run("grep", &grep_args(pattern, expanded.as_os_str()))?;
        grep_outcome(output.status.code()).ok_or_else(|| command_error("grep", path, &output))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl FileSink for File {
    fn finish(self: Box<Self>) -> Result<()> {
        self.sync_all()?;
        Ok(())
    }
}
